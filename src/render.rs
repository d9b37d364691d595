// Presentation helpers: Markdown for bot bubbles and plain-text output for the terminal.

use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag};

use crate::predictor::PredictionResult;
use crate::transcript::ChatMessage;

/// Renders bot Markdown to HTML. Raw HTML in the source is shown as text, never injected,
/// and link or image targets with a scheme other than http, https or mailto are dropped.
pub fn markdown_to_html(source: &str) -> String {
    let parser = Parser::new_ext(source, Options::ENABLE_STRIKETHROUGH).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: safe_url(dest_url, "#"),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Image {
            link_type,
            dest_url: safe_url(dest_url, ""),
            title,
            id,
        }),
        other => other,
    });
    let mut out = String::with_capacity(source.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Keeps relative URLs and http(s)/mailto ones; anything else becomes `fallback`.
fn safe_url<'a>(url: CowStr<'a>, fallback: &'static str) -> CowStr<'a> {
    // Browsers ignore whitespace and control characters inside a scheme.
    let cleaned: String = url
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    let allowed = match cleaned.find([':', '/', '?', '#']) {
        Some(i) if cleaned[i..].starts_with(':') => matches!(
            cleaned[..i].to_ascii_lowercase().as_str(),
            "http" | "https" | "mailto"
        ),
        _ => true,
    };
    if allowed {
        url
    } else {
        CowStr::Borrowed(fallback)
    }
}

const BAR_CELLS: usize = 30;

/// `label  ████████░░░░  42%`
pub fn prediction_line(result: &PredictionResult, label_width: usize) -> String {
    let filled = usize::from(result.confidence) * BAR_CELLS / 100;
    format!(
        "{:<width$}  {}{}  {:>3}%",
        result.label,
        "█".repeat(filled),
        "░".repeat(BAR_CELLS - filled),
        result.confidence,
        width = label_width
    )
}

pub fn prediction_table(results: &[PredictionResult]) -> String {
    let width = results.iter().map(|r| r.label.chars().count()).max().unwrap_or(0);
    results
        .iter()
        .map(|r| prediction_line(r, width))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Terminal form of one transcript entry. Buttons are numbered so they can be picked by
/// typing the number.
pub fn message_text(message: &ChatMessage) -> String {
    match message {
        ChatMessage::UserText { text } => format!("You: {}", text),
        ChatMessage::BotText { text } => format!("Mentor: {}", text),
        ChatMessage::ChoiceSet { options } => numbered(options.iter().map(|o| o.label.as_str())),
        ChatMessage::Card {
            title,
            description,
            image_url,
            options,
        } => {
            let mut lines = vec![format!("[{}]", title)];
            if !description.is_empty() {
                lines.push(description.clone());
            }
            if let Some(url) = image_url {
                lines.push(format!("(image: {})", url));
            }
            if !options.is_empty() {
                lines.push(numbered(options.iter().map(|o| o.label.as_str())));
            }
            lines.join("\n")
        }
    }
}

fn numbered<'a>(labels: impl Iterator<Item = &'a str>) -> String {
    labels
        .enumerate()
        .map(|(i, label)| format!("  {}) {}", i + 1, label))
        .collect::<Vec<_>>()
        .join("\n")
}
