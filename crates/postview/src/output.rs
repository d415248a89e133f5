use std::fmt::Write;

use clap::ValueEnum;

use crate::page::PostView;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs every rendered post as a line of JSON.
    Json,
    /// Outputs every rendered post as text.
    Pretty,
}

/// Formats a rendered post for the terminal.
pub fn format_pretty(view: &PostView) -> String {
    let mut out = String::new();
    match view {
        PostView::Loaded { post } => {
            writeln!(out, "# {}", post.title).ok();
            writeln!(out, "post {} by user {}", post.id, post.user_id).ok();
            writeln!(out).ok();
            writeln!(out, "{}", post.body).ok();
        }
        PostView::Failed { id, message, .. } => {
            writeln!(out, "Something went wrong while loading post {id}:").ok();
            writeln!(out, "  {message}").ok();
            writeln!(out, "Run again with --reload to retry.").ok();
        }
    }
    out
}

pub fn format_json(view: &PostView) -> serde_json::Result<String> {
    serde_json::to_string(view)
}

pub fn print(view: &PostView, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", format_json(view)?),
        OutputFormat::Pretty => println!("{}", format_pretty(view)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::post::Post;

    fn loaded() -> PostView {
        PostView::Loaded {
            post: Arc::new(Post {
                user_id: 1,
                id: 2,
                title: "qui est esse".into(),
                body: "est rerum tempore".into(),
            }),
        }
    }

    fn failed() -> PostView {
        PostView::Failed {
            id: 0,
            message: "request failed with status 404".into(),
            status: Some(404),
        }
    }

    #[test]
    fn test_pretty() {
        insta::assert_snapshot!(format_pretty(&loaded()).trim_end(), @r"
        # qui est esse
        post 2 by user 1

        est rerum tempore
        ");
        insta::assert_snapshot!(format_pretty(&failed()).trim_end(), @r"
        Something went wrong while loading post 0:
          request failed with status 404
        Run again with --reload to retry.
        ");
    }

    #[test]
    fn test_json() {
        insta::assert_snapshot!(
            format_json(&loaded()).unwrap(),
            @r#"{"state":"loaded","userId":1,"id":2,"title":"qui est esse","body":"est rerum tempore"}"#
        );
        insta::assert_snapshot!(
            format_json(&failed()).unwrap(),
            @r#"{"state":"failed","id":0,"message":"request failed with status 404","status":404}"#
        );
    }
}
