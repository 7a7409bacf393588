use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{Decision, DecisionKind, PendingApproval};

pub const SELECT_PROMPT: &str = "Select an option: ";
pub const INVALID_OPTION_MESSAGE: &str = "Invalid option. Please choose accept, reject, or skip.";

/// Shows `pending` to an operator and reads decisions until a valid one
/// arrives. Returns `UnexpectedEof` if input closes first.
pub async fn prompt_decision<R, W>(
    reader: &mut R,
    writer: &mut W,
    pending: &PendingApproval,
    allowed: &[DecisionKind],
    default_reason: &str,
) -> io::Result<Decision>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let options = allowed
        .iter()
        .map(DecisionKind::operator_word)
        .collect::<Vec<_>>()
        .join(", ");
    writer
        .write_all(format!("\n{}\n\nOptions: {options}\n", pending.description).as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        writer.write_all(SELECT_PROMPT.as_bytes()).await?;
        writer.flush().await?;

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input closed before a decision was made",
            ));
        }

        match Decision::parse(&line, default_reason) {
            Ok(decision) if allowed.contains(&decision.kind()) => return Ok(decision),
            Ok(_) | Err(_) => {
                writer
                    .write_all(format!("{INVALID_OPTION_MESSAGE}\n").as_bytes())
                    .await?;
            }
        }
    }
}
