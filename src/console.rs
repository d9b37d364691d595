// Terminal front ends: an interactive chat loop and one-shot classification.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

use crate::chat::{ChatWidget, TurnOutcome};
use crate::constants::APP_TITLE;
use crate::predictor::{PredictionResult, Predictor, SubmitOutcome};
use crate::render::{message_text, prediction_table};

/// What a line typed at the prompt asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Quit,
    /// Text to send; a bare number picks that button of the latest choice set or card.
    Send(String),
}

pub fn interpret_line(line: &str, chat: &ChatWidget) -> ConsoleInput {
    let trimmed = line.trim();
    if trimmed == "/quit" || trimmed == "/exit" {
        return ConsoleInput::Quit;
    }
    let picked = trimmed
        .parse::<usize>()
        .ok()
        .and_then(|index| chat.option_label(index));
    ConsoleInput::Send(picked.unwrap_or_else(|| line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Runs the chat until `/quit` or end of input, printing every reply as it lands.
pub async fn run_chat<R, W>(chat: &ChatWidget, input: R, mut output: W) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(session = %chat.session(), "Starting terminal chat");
    write_line(
        &mut output,
        &format!("{} chat. Type a message, a button number, or /quit.", APP_TITLE),
    )
    .await?;

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        let text = match interpret_line(&line, chat) {
            ConsoleInput::Quit => break,
            ConsoleInput::Send(text) => text,
        };
        if let TurnOutcome::Completed { replies } = chat.send_turn(&text).await {
            for reply in &replies {
                write_line(&mut output, &message_text(reply)).await?;
            }
        }
    }

    info!("Chat session finished");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Classifies one image file through the prediction pipeline.
pub async fn classify_file(predictor: &Arc<Predictor>, path: &Path) -> Result<Vec<PredictionResult>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match predictor.submit_image(&bytes).await? {
        SubmitOutcome::Classified(results) => Ok(results),
        SubmitOutcome::Queued => Err(anyhow::anyhow!("Model is not loaded")),
    }
}

pub fn print_predictions(results: &[PredictionResult]) {
    println!("{}", prediction_table(results));
}
