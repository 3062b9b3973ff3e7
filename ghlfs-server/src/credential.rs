//! The page shown after a successful login, telling the user how to hand the
//! session to Git's credential helper.

use std::str::FromStr;

use ghlfs_common::EscHtmlFmt;

pub const CREDENTIAL_USERNAME: &str = "session";

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Shell {
    #[default]
    Bash,
    Zsh,
    PowerShell,
}

impl Shell {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::PowerShell => "powershell",
        }
    }
}

impl FromStr for Shell {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(Self::Bash),
            "zsh" => Ok(Self::Zsh),
            "powershell" | "pwsh" => Ok(Self::PowerShell),
            _ => Err(()),
        }
    }
}

fn credential_lines(host: &str, session_id: &str) -> String {
    format!(
        "protocol=https\nhost={host}\nusername={CREDENTIAL_USERNAME}\npassword={session_id}\n"
    )
}

/// The shell command storing the session as a Git credential.
pub fn snippet(shell: Shell, host: &str, session_id: &str) -> String {
    let lines = credential_lines(host, session_id);
    match shell {
        Shell::Bash | Shell::Zsh => format!("git credential approve <<'EOF'\n{lines}EOF\n"),
        Shell::PowerShell => format!("@\"\n{lines}\"@ | git credential approve\n"),
    }
}

pub fn render_page(shell: Shell, host: &str, session_id: &str) -> String {
    let snippet = snippet(shell, host, session_id);
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Git LFS login</title></head>\n<body>\n",
    );
    html.push_str(&format!(
        "<h1>Logged in</h1>\n<p>Run the following in {} to let Git use this session for <code>{}</code>:</p>\n<pre><code>{}</code></pre>\n<p>",
        shell.as_str(),
        EscHtmlFmt(host),
        EscHtmlFmt(&snippet),
    ));
    for other in [Shell::Bash, Shell::Zsh, Shell::PowerShell] {
        if other == shell {
            continue;
        }
        html.push_str(&format!(
            "<a href=\"?session_id={}&amp;host={}&amp;shell={}\">{}</a> ",
            EscHtmlFmt(session_id),
            EscHtmlFmt(host),
            other.as_str(),
            other.as_str(),
        ));
    }
    html.push_str("</p>\n</body>\n</html>\n");
    html
}
