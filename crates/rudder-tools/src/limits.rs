// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rudder_config::{OutputLimits, TruncateMode};
use rudder_model::ContentBlock;

/// Bound the text blocks of a tool output before they enter the
/// conversation.
///
/// Outputs at or below `large_output_threshold` bytes pass through
/// untouched. Larger text is cut to the configured line/byte/char caps
/// according to `truncate_mode`, with an explicit omission notice so the
/// model knows content was dropped. Non-text blocks pass through unchanged.
pub fn apply_limits(blocks: Vec<ContentBlock>, limits: &OutputLimits) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .map(|b| match b {
            ContentBlock::Text { text } => ContentBlock::Text {
                text: truncate_text(&text, limits),
            },
            other => other,
        })
        .collect()
}

fn truncate_text(content: &str, limits: &OutputLimits) -> String {
    if content.len() <= limits.large_output_threshold {
        return content.to_string();
    }
    let lines: Vec<&str> = content.lines().collect();
    let fits = lines.len() <= limits.max_lines
        && content.len() <= limits.max_bytes
        && content.chars().count() <= limits.max_chars;
    if fits {
        return content.to_string();
    }

    let (head, tail) = match limits.truncate_mode {
        TruncateMode::Head => (
            take_lines(&lines, limits.max_lines, limits.max_bytes, limits.max_chars),
            Vec::new(),
        ),
        TruncateMode::Tail => {
            let rev: Vec<&str> = lines.iter().rev().copied().collect();
            let mut tail = take_lines(&rev, limits.max_lines, limits.max_bytes, limits.max_chars);
            tail.reverse();
            (Vec::new(), tail)
        }
        TruncateMode::HeadTail => {
            let head = take_lines(
                &lines,
                limits.max_lines / 2,
                limits.max_bytes / 2,
                limits.max_chars / 2,
            );
            let rev: Vec<&str> = lines[head.len()..].iter().rev().copied().collect();
            let mut tail = take_lines(
                &rev,
                limits.max_lines / 2,
                limits.max_bytes / 2,
                limits.max_chars / 2,
            );
            tail.reverse();
            (head, tail)
        }
    };

    let kept_bytes: usize = head.iter().chain(tail.iter()).map(|l| l.len()).sum();
    let omitted_lines = lines.len() - head.len() - tail.len();
    let omitted_bytes = content.len().saturating_sub(kept_bytes);
    let notice = format!(
        "[... {omitted_lines} lines omitted ({omitted_bytes} bytes); output truncated to fit context budget ...]"
    );

    let mut parts: Vec<&str> = head;
    parts.push(notice.as_str());
    parts.extend(tail);
    parts.join("\n")
}

/// Accumulate leading lines while all three caps hold.
fn take_lines<'a>(
    lines: &[&'a str],
    max_lines: usize,
    max_bytes: usize,
    max_chars: usize,
) -> Vec<&'a str> {
    let mut kept = Vec::new();
    let mut bytes = 0usize;
    let mut chars = 0usize;
    for line in lines.iter().take(max_lines) {
        let needed_bytes = line.len() + usize::from(!kept.is_empty());
        let needed_chars = line.chars().count() + usize::from(!kept.is_empty());
        if bytes + needed_bytes > max_bytes || chars + needed_chars > max_chars {
            break;
        }
        bytes += needed_bytes;
        chars += needed_chars;
        kept.push(*line);
    }
    kept
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(mode: TruncateMode) -> OutputLimits {
        OutputLimits {
            max_lines: 10,
            max_bytes: 400,
            max_chars: 400,
            large_output_threshold: 64,
            truncate_mode: mode,
        }
    }

    fn make_lines(n: usize) -> String {
        (0..n)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn small_output_passes_through() {
        let l = limits(TruncateMode::HeadTail);
        assert_eq!(truncate_text("short output", &l), "short output");
    }

    #[test]
    fn output_under_threshold_never_truncated_even_with_many_lines() {
        let mut l = limits(TruncateMode::Head);
        l.large_output_threshold = 10_000;
        let content = make_lines(100);
        assert_eq!(truncate_text(&content, &l), content);
    }

    #[test]
    fn head_mode_keeps_leading_lines() {
        let l = limits(TruncateMode::Head);
        let out = truncate_text(&make_lines(100), &l);
        assert!(out.starts_with("line 0"));
        assert!(out.contains("omitted"));
        assert!(!out.contains("line 99"));
    }

    #[test]
    fn tail_mode_keeps_trailing_lines() {
        let l = limits(TruncateMode::Tail);
        let out = truncate_text(&make_lines(100), &l);
        assert!(out.ends_with("line 99"));
        assert!(out.contains("omitted"));
        assert!(!out.contains("line 0\n"));
    }

    #[test]
    fn head_tail_mode_keeps_both_ends() {
        let l = limits(TruncateMode::HeadTail);
        let out = truncate_text(&make_lines(100), &l);
        assert!(out.contains("line 0"));
        assert!(out.contains("line 99"));
        assert!(out.contains("omitted"));
        assert!(!out.contains("line 50\n"));
    }

    #[test]
    fn line_cap_enforced() {
        let l = limits(TruncateMode::Head);
        let out = truncate_text(&make_lines(100), &l);
        // 10-line cap plus the notice line.
        assert!(out.lines().count() <= 11, "{}", out.lines().count());
    }

    #[test]
    fn byte_cap_enforced_on_long_lines() {
        let mut l = limits(TruncateMode::Head);
        l.max_bytes = 100;
        let content = (0..20)
            .map(|i| format!("{}-{}", i, "x".repeat(60)))
            .collect::<Vec<_>>()
            .join("\n");
        let out = truncate_text(&content, &l);
        let kept: String = out
            .lines()
            .take_while(|line| !line.starts_with("[..."))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(kept.len() <= 100, "kept {} bytes", kept.len());
    }

    #[test]
    fn notice_reports_omitted_bytes() {
        let l = limits(TruncateMode::Head);
        let out = truncate_text(&make_lines(100), &l);
        assert!(out.contains("bytes"));
    }

    #[test]
    fn apply_limits_only_touches_text_blocks() {
        let l = limits(TruncateMode::Head);
        let blocks = vec![
            ContentBlock::text(make_lines(100)),
            ContentBlock::Image {
                data: "aGk=".into(),
                mime: "image/png".into(),
            },
        ];
        let out = apply_limits(blocks, &l);
        assert!(matches!(&out[0], ContentBlock::Text { text } if text.contains("omitted")));
        assert!(matches!(&out[1], ContentBlock::Image { .. }));
    }
}
