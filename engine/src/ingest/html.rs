use ego_tree::iter::Edge;
use scraper::{Html, Node};

/// Elements whose end marks a paragraph boundary in the extracted text.
fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "section"
            | "article"
            | "li"
            | "blockquote"
            | "pre"
            | "br"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
    )
}

/// Reduces feed HTML to plain text, keeping paragraph boundaries as blank
/// lines and dropping script/style content. Plain-text input passes through
/// with whitespace normalized.
pub fn strip_html(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut skip_depth = 0usize;

    for edge in fragment.tree.root().traverse() {
        match edge {
            Edge::Open(node) => match node.value() {
                Node::Element(el) => {
                    if matches!(el.name(), "script" | "style" | "noscript") {
                        skip_depth += 1;
                    }
                }
                Node::Text(text) => {
                    if skip_depth == 0 {
                        current.push_str(text);
                        current.push(' ');
                    }
                }
                _ => {}
            },
            Edge::Close(node) => {
                if let Node::Element(el) = node.value() {
                    if matches!(el.name(), "script" | "style" | "noscript") {
                        skip_depth = skip_depth.saturating_sub(1);
                    } else if is_block(el.name()) {
                        flush_paragraph(&mut paragraphs, &mut current);
                    }
                }
            }
        }
    }
    flush_paragraph(&mut paragraphs, &mut current);

    paragraphs.join("\n\n")
}

fn flush_paragraph(paragraphs: &mut Vec<String>, current: &mut String) {
    let collapsed = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.is_empty() {
        paragraphs.push(collapsed);
    }
    current.clear();
}
