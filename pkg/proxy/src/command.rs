use tokio::process::Command;

use crate::error::ProxyError;

/// Run `program args..` and return its stdout. A non-zero exit maps to
/// [`ProxyError::Command`] carrying the trimmed stderr (or stdout when
/// stderr is empty).
pub(crate) async fn run(program: &str, args: &[String]) -> Result<String, ProxyError> {
    let rendered = render(program, args);
    tracing::trace!("Exec: {}", rendered);

    let output = Command::new(program).args(args).output().await.map_err(|e| {
        ProxyError::Command {
            command: rendered.clone(),
            message: e.to_string(),
        }
    })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    Err(ProxyError::Command {
        command: rendered,
        message,
    })
}

fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// True if a failed command reported a message containing any of `needles`.
pub(crate) fn failed_with(err: &ProxyError, needles: &[&str]) -> bool {
    match err {
        ProxyError::Command { message, .. } => {
            let message = message.to_ascii_lowercase();
            needles.iter().any(|n| message.contains(n))
        }
        _ => false,
    }
}
