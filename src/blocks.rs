//! Markdown ⇄ Notion block conversion.
//!
//! Local documents are markdown; Notion stores pages as a list of typed
//! blocks. This module converts between the two for the subset both sides
//! can express:
//!
//! | Markdown                 | Block                           |
//! |--------------------------|---------------------------------|
//! | `#`, `##`, `###`         | `heading_1` … `heading_3`       |
//! | paragraph                | `paragraph`                     |
//! | fenced code with language| `code`                          |
//! | pipe table               | `table` + `table_row` children  |
//! | `- item` / `1. item`     | `bulleted_list_item` / `numbered_list_item` |
//! | `> quote`                | `quote`                         |
//! | `---`                    | `divider`                       |
//!
//! Callouts exist only on the Notion side; they are rendered as a quote
//! starting with their icon. Inline formatting is carried as plain text.
//!
//! The conversion is not byte-exact (trailing whitespace and blank-line runs
//! are normalized), which is why the Notion adapter reports
//! `verbatim_content = false`.

use serde_json::{json, Value};

/// Notion rejects rich text objects longer than this many characters.
pub const MAX_TEXT_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, text: String },
    Paragraph(String),
    Code { language: String, text: String },
    Table { headers: Vec<String>, rows: Vec<Vec<String>> },
    Bullet(String),
    Numbered(String),
    Quote(String),
    Callout { icon: String, text: String },
    Divider,
}

// ============ Markdown ============

/// Parse markdown into blocks.
pub fn parse_markdown(input: &str) -> Vec<Block> {
    let lines: Vec<&str> = input.lines().collect();
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut i = 0;

    fn flush(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
        if !paragraph.is_empty() {
            blocks.push(Block::Paragraph(paragraph.join("\n")));
            paragraph.clear();
        }
    }

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.is_empty() {
            flush(&mut paragraph, &mut blocks);
            i += 1;
            continue;
        }

        if let Some(language) = trimmed.strip_prefix("```") {
            flush(&mut paragraph, &mut blocks);
            let mut code = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                code.push(lines[i]);
                i += 1;
            }
            // Skip the closing fence (if any).
            i += 1;
            blocks.push(Block::Code {
                language: language.trim().to_string(),
                text: code.join("\n"),
            });
            continue;
        }

        if trimmed.starts_with('|') {
            flush(&mut paragraph, &mut blocks);
            let mut table_lines = Vec::new();
            while i < lines.len() && lines[i].trim().starts_with('|') {
                table_lines.push(lines[i].trim());
                i += 1;
            }
            blocks.push(parse_table(&table_lines));
            continue;
        }

        let block = if let Some((level, text)) = heading(trimmed) {
            Some(Block::Heading {
                level,
                text: text.to_string(),
            })
        } else if is_divider(trimmed) {
            Some(Block::Divider)
        } else if let Some(text) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        {
            Some(Block::Bullet(text.to_string()))
        } else if let Some(text) = numbered(trimmed) {
            Some(Block::Numbered(text.to_string()))
        } else if let Some(text) = trimmed.strip_prefix('>') {
            let text = text.trim_start();
            let continues = paragraph.is_empty()
                && i > 0
                && lines[i - 1].trim_start().starts_with('>');
            if let (true, Some(Block::Quote(prev))) = (continues, blocks.last_mut()) {
                prev.push('\n');
                prev.push_str(text);
                i += 1;
                continue;
            }
            Some(Block::Quote(text.to_string()))
        } else {
            None
        };

        match block {
            Some(block) => {
                flush(&mut paragraph, &mut blocks);
                blocks.push(block);
            }
            None => paragraph.push(trimmed),
        }
        i += 1;
    }
    flush(&mut paragraph, &mut blocks);
    blocks
}

fn heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = line[hashes..].strip_prefix(' ')?;
    Some(((hashes as u8).min(3), rest.trim()))
}

fn is_divider(line: &str) -> bool {
    line.len() >= 3
        && (line.chars().all(|c| c == '-') || line.chars().all(|c| c == '*'))
}

fn numbered(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    line[digits..].strip_prefix(". ")
}

fn split_row(line: &str) -> Vec<String> {
    let inner = line.trim().trim_start_matches('|').trim_end_matches('|');
    inner.split('|').map(|c| c.trim().to_string()).collect()
}

fn is_separator_row(line: &str) -> bool {
    split_row(line)
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':')))
}

fn parse_table(lines: &[&str]) -> Block {
    let mut rows = lines.iter().map(|l| (*l, split_row(l)));
    let headers = rows.next().map(|(_, cells)| cells).unwrap_or_default();
    let rows = rows
        .filter(|(line, _)| !is_separator_row(line))
        .map(|(_, cells)| cells)
        .collect();
    Block::Table { headers, rows }
}

/// Render blocks as markdown, ending with a newline.
pub fn render_markdown(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Block> = None;
    let mut number = 0;

    for block in blocks {
        let same_list = matches!(
            (prev, block),
            (Some(Block::Bullet(_)), Block::Bullet(_)) | (Some(Block::Numbered(_)), Block::Numbered(_))
        );
        if prev.is_some() {
            out.push_str(if same_list { "\n" } else { "\n\n" });
        }
        if !matches!(block, Block::Numbered(_)) || !same_list {
            number = 0;
        }

        match block {
            Block::Heading { level, text } => {
                out.push_str(&"#".repeat(usize::from(*level)));
                out.push(' ');
                out.push_str(text);
            }
            Block::Paragraph(text) => out.push_str(text),
            Block::Code { language, text } => {
                out.push_str("```");
                out.push_str(language);
                out.push('\n');
                out.push_str(text);
                out.push_str("\n```");
            }
            Block::Table { headers, rows } => render_table(&mut out, headers, rows),
            Block::Bullet(text) => {
                out.push_str("- ");
                out.push_str(text);
            }
            Block::Numbered(text) => {
                number += 1;
                out.push_str(&format!("{}. {}", number, text));
            }
            Block::Quote(text) => out.push_str(&quote_lines(text)),
            Block::Callout { icon, text } => {
                let body = if icon.is_empty() {
                    text.clone()
                } else {
                    format!("{} {}", icon, text)
                };
                out.push_str(&quote_lines(&body));
            }
            Block::Divider => out.push_str("---"),
        }
        prev = Some(block);
    }

    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn quote_lines(text: &str) -> String {
    text.lines()
        .map(|l| format!("> {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_table(out: &mut String, headers: &[String], rows: &[Vec<String>]) {
    let row = |cells: &[String]| format!("| {} |", cells.join(" | "));
    out.push_str(&row(headers));
    out.push('\n');
    out.push_str(&format!(
        "|{}|",
        vec!["---"; headers.len().max(1)].join("|")
    ));
    for r in rows {
        out.push('\n');
        out.push_str(&row(r));
    }
}

// ============ Notion JSON ============

/// Rich text array for `text`, split into chunks Notion accepts.
pub fn rich_text(text: &str) -> Value {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return json!([]);
    }
    let parts: Vec<Value> = chars
        .chunks(MAX_TEXT_LEN)
        .map(|chunk| {
            let content: String = chunk.iter().collect();
            json!({ "type": "text", "text": { "content": content } })
        })
        .collect();
    Value::Array(parts)
}

/// Concatenated plain text of a rich text array.
pub fn plain_text(rich: &Value) -> String {
    rich.as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| {
                    p.get("plain_text")
                        .or_else(|| p.get("text").and_then(|t| t.get("content")))
                        .and_then(|v| v.as_str())
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn text_block(kind: &str, text: &str) -> Value {
    let mut block = json!({ "object": "block", "type": kind });
    block[kind] = json!({ "rich_text": rich_text(text) });
    block
}

/// Notion API representation of a block.
pub fn to_notion(block: &Block) -> Value {
    match block {
        Block::Heading { level, text } => {
            let kind = format!("heading_{}", (*level).clamp(1, 3));
            text_block(&kind, text)
        }
        Block::Paragraph(text) => text_block("paragraph", text),
        Block::Code { language, text } => {
            let language = if language.is_empty() {
                "plain text"
            } else {
                language.as_str()
            };
            json!({
                "object": "block",
                "type": "code",
                "code": { "rich_text": rich_text(text), "language": language }
            })
        }
        Block::Table { headers, rows } => {
            let width = headers.len().max(rows.iter().map(Vec::len).max().unwrap_or(0));
            let row = |cells: &[String]| {
                let mut cells: Vec<Value> = cells.iter().map(|c| rich_text(c)).collect();
                cells.resize(width, json!([]));
                json!({
                    "object": "block",
                    "type": "table_row",
                    "table_row": { "cells": cells }
                })
            };
            let mut children = vec![row(headers)];
            children.extend(rows.iter().map(|r| row(r)));
            json!({
                "object": "block",
                "type": "table",
                "table": {
                    "table_width": width,
                    "has_column_header": true,
                    "has_row_header": false,
                    "children": children
                }
            })
        }
        Block::Bullet(text) => text_block("bulleted_list_item", text),
        Block::Numbered(text) => text_block("numbered_list_item", text),
        Block::Quote(text) => text_block("quote", text),
        Block::Callout { icon, text } => json!({
            "object": "block",
            "type": "callout",
            "callout": {
                "rich_text": rich_text(text),
                "icon": { "type": "emoji", "emoji": icon }
            }
        }),
        Block::Divider => json!({ "object": "block", "type": "divider", "divider": {} }),
    }
}

/// Parse one block returned by the Notion API.
///
/// Tables come back without their rows; pass the `table_row` children
/// separately to [`table_from_rows`]. Unknown block types that still carry
/// rich text degrade to paragraphs; others are dropped.
pub fn from_notion(value: &Value) -> Option<Block> {
    let kind = value.get("type")?.as_str()?;
    let body = value.get(kind)?;
    let text = || plain_text(body.get("rich_text").unwrap_or(&Value::Null));

    let block = match kind {
        "heading_1" => Block::Heading { level: 1, text: text() },
        "heading_2" => Block::Heading { level: 2, text: text() },
        "heading_3" => Block::Heading { level: 3, text: text() },
        "paragraph" => Block::Paragraph(text()),
        "code" => {
            let language = body
                .get("language")
                .and_then(|l| l.as_str())
                .filter(|l| *l != "plain text")
                .unwrap_or_default()
                .to_string();
            Block::Code {
                language,
                text: text(),
            }
        }
        "bulleted_list_item" => Block::Bullet(text()),
        "numbered_list_item" => Block::Numbered(text()),
        "quote" => Block::Quote(text()),
        "callout" => Block::Callout {
            icon: body
                .get("icon")
                .and_then(|i| i.get("emoji"))
                .and_then(|e| e.as_str())
                .unwrap_or_default()
                .to_string(),
            text: text(),
        },
        "divider" => Block::Divider,
        "table" => Block::Table {
            headers: Vec::new(),
            rows: Vec::new(),
        },
        _ if body.get("rich_text").is_some() => Block::Paragraph(text()),
        _ => return None,
    };
    Some(block)
}

/// Build a table from its `table_row` children; the first row is the header.
pub fn table_from_rows(children: &[Value]) -> Block {
    let mut rows: Vec<Vec<String>> = children
        .iter()
        .filter_map(|child| {
            let cells = child.get("table_row")?.get("cells")?.as_array()?;
            Some(cells.iter().map(plain_text).collect())
        })
        .collect();
    let headers = if rows.is_empty() {
        Vec::new()
    } else {
        rows.remove(0)
    };
    Block::Table { headers, rows }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Main Title

An example paragraph with some important information.

## Code Section

```python
def hello_world():
    print('Hello from docsync!')
```

### Subsection

| Name  | Age | Role     |
|-------|-----|----------|
| Joao  | 30  | Dev      |
| Maria | 28  | Designer |
";

    #[test]
    fn parses_headings_code_and_tables() {
        let blocks = parse_markdown(SAMPLE);
        assert_eq!(blocks.len(), 6);
        assert_eq!(
            blocks[0],
            Block::Heading {
                level: 1,
                text: "Main Title".into()
            }
        );
        assert!(matches!(&blocks[1], Block::Paragraph(p) if p.starts_with("An example")));
        match &blocks[3] {
            Block::Code { language, text } => {
                assert_eq!(language, "python");
                assert!(text.contains("def hello_world():"));
            }
            other => panic!("expected code, got {:?}", other),
        }
        match &blocks[5] {
            Block::Table { headers, rows } => {
                assert_eq!(headers, &["Name", "Age", "Role"]);
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1], vec!["Maria", "28", "Designer"]);
            }
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn rendering_reparses_to_the_same_blocks() {
        let blocks = parse_markdown(SAMPLE);
        let again = parse_markdown(&render_markdown(&blocks));
        assert_eq!(blocks, again);
    }

    #[test]
    fn lists_quotes_and_dividers() {
        let md = "- one\n- two\n\n1. first\n2. second\n\n> quoted\n> more\n\n---\n";
        let blocks = parse_markdown(md);
        assert_eq!(
            blocks,
            vec![
                Block::Bullet("one".into()),
                Block::Bullet("two".into()),
                Block::Numbered("first".into()),
                Block::Numbered("second".into()),
                Block::Quote("quoted\nmore".into()),
                Block::Divider,
            ]
        );
        assert_eq!(render_markdown(&blocks), md);
    }

    #[test]
    fn notion_json_shapes() {
        let heading = to_notion(&Block::Heading {
            level: 2,
            text: "Title".into(),
        });
        assert_eq!(heading["type"], "heading_2");
        assert_eq!(heading["heading_2"]["rich_text"][0]["text"]["content"], "Title");

        let code = to_notion(&Block::Code {
            language: "python".into(),
            text: "print('test')".into(),
        });
        assert_eq!(code["code"]["language"], "python");

        let table = to_notion(&Block::Table {
            headers: vec!["A".into(), "B".into()],
            rows: vec![vec!["1".into(), "2".into()], vec!["3".into(), "4".into()]],
        });
        assert_eq!(table["table"]["table_width"], 2);
        assert_eq!(table["table"]["has_column_header"], true);
        assert_eq!(table["table"]["children"].as_array().unwrap().len(), 3);

        let callout = to_notion(&Block::Callout {
            icon: "💡".into(),
            text: "Important!".into(),
        });
        assert_eq!(callout["callout"]["icon"]["emoji"], "💡");
        assert_eq!(callout["callout"]["rich_text"][0]["text"]["content"], "Important!");
    }

    #[test]
    fn long_text_is_split() {
        let text = "x".repeat(MAX_TEXT_LEN * 2 + 10);
        let rich = rich_text(&text);
        let parts = rich.as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(plain_text(&rich), text);
    }

    #[test]
    fn reads_blocks_from_notion() {
        let callout = json!({
            "type": "callout",
            "callout": {
                "rich_text": [{ "plain_text": "Heads up" }],
                "icon": { "type": "emoji", "emoji": "⚠️" }
            }
        });
        assert_eq!(
            from_notion(&callout),
            Some(Block::Callout {
                icon: "⚠️".into(),
                text: "Heads up".into()
            })
        );

        let code = json!({
            "type": "code",
            "code": { "rich_text": [{ "plain_text": "ls" }], "language": "plain text" }
        });
        assert_eq!(
            from_notion(&code),
            Some(Block::Code {
                language: String::new(),
                text: "ls".into()
            })
        );

        let image = json!({ "type": "image", "image": { "file": {} } });
        assert_eq!(from_notion(&image), None);

        let table = to_notion(&Block::Table {
            headers: vec!["A".into()],
            rows: vec![vec!["1".into()]],
        });
        let children = table["table"]["children"].as_array().unwrap();
        assert_eq!(
            table_from_rows(children),
            Block::Table {
                headers: vec!["A".into()],
                rows: vec![vec!["1".into()]]
            }
        );
    }
}
