//! Postview.
//!
//! Shows posts from a post API the way a suspending UI would: each post is loaded at most once,
//! posts around the current one can be preloaded, and posts rendered elsewhere can be injected as
//! server state.

use suspend_cache::logging;

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
