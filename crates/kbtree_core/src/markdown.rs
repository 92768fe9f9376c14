//! HTML to Markdown conversion for answer bodies.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};

static WRAPPED_PRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<table[^>]*>\s*(?:<tbody[^>]*>\s*)?<tr[^>]*>\s*<td[^>]*>\s*(<pre\b.*?</pre>)\s*</td>\s*</tr>\s*(?:</tbody>\s*)?</table>",
    )
    .expect("valid wrapped pre pattern")
});
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank line pattern"));

/// What to do with tags the converter has no Markdown form for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownTags {
    /// Keep only the tag's content.
    Bypass,
    /// Emit the tag's HTML verbatim.
    #[default]
    PassThrough,
    /// Drop the tag and its content.
    Drop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkdownOptions {
    pub unknown_tags: UnknownTags,
}

/// Unwrap `<pre>` blocks that authors placed inside a single-cell table.
pub fn sanitize_html(html: &str) -> String {
    WRAPPED_PRE
        .replace_all(html, |captures: &Captures<'_>| {
            let pre = &captures[1];
            if pre.to_ascii_lowercase().contains("</td") {
                captures[0].to_string()
            } else {
                pre.to_string()
            }
        })
        .into_owned()
}

pub fn html_to_markdown(html: &str, options: &MarkdownOptions) -> String {
    let fragment = Html::parse_fragment(html);
    let converter = Converter { options };
    let raw = converter.children(fragment.root_element());
    tidy(&raw)
}

const TRANSPARENT_TAGS: &[&str] = &[
    "html", "body", "span", "font", "u", "small", "big", "center", "label", "abbr", "tbody",
    "thead", "tfoot", "figure", "picture", "mark", "sup", "sub", "time",
];
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "aside", "nav", "figcaption",
    "dl", "dd", "dt", "details", "summary",
];
const DROPPED_TAGS: &[&str] = &["script", "style", "head", "title", "meta", "link", "noscript"];

struct Converter<'a> {
    options: &'a MarkdownOptions,
}

impl Converter<'_> {
    fn children(&self, element: ElementRef<'_>) -> String {
        let mut output = String::new();
        for child in element.children() {
            match child.value() {
                Node::Text(text) => output.push_str(&WHITESPACE.replace_all(text, " ")),
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        output.push_str(&self.element(child));
                    }
                }
                _ => {}
            }
        }
        output
    }

    fn element(&self, element: ElementRef<'_>) -> String {
        let name = element.value().name().to_ascii_lowercase();
        match name.as_str() {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                let text = self.children(element);
                block(&format!("{} {}", "#".repeat(level), text.trim()))
            }
            "br" => "  \n".to_string(),
            "hr" => block("---"),
            "strong" | "b" => wrap_inline(&self.children(element), "**"),
            "em" | "i" => wrap_inline(&self.children(element), "*"),
            "s" | "del" | "strike" => wrap_inline(&self.children(element), "~~"),
            "code" => {
                let text = element.text().collect::<String>();
                if text.trim().is_empty() {
                    String::new()
                } else if text.contains('`') {
                    format!("`` {} ``", text.trim())
                } else {
                    format!("`{}`", text.trim())
                }
            }
            "pre" => fenced(element),
            "a" => self.anchor(element),
            "img" => image(element),
            "ul" => self.list(element, false),
            "ol" => self.list(element, true),
            "li" => block(self.children(element).trim()),
            "blockquote" => {
                let inner = tidy(&self.children(element));
                let quoted = inner
                    .trim_end()
                    .lines()
                    .map(|line| {
                        if line.is_empty() {
                            ">".to_string()
                        } else {
                            format!("> {line}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                block(&quoted)
            }
            "table" => self.table(element),
            tag if TRANSPARENT_TAGS.contains(&tag) => self.children(element),
            tag if BLOCK_TAGS.contains(&tag) => block(self.children(element).trim()),
            tag if DROPPED_TAGS.contains(&tag) => String::new(),
            _ => match self.options.unknown_tags {
                UnknownTags::PassThrough => element.html(),
                UnknownTags::Bypass => self.children(element),
                UnknownTags::Drop => String::new(),
            },
        }
    }

    fn anchor(&self, element: ElementRef<'_>) -> String {
        let text = self.children(element);
        let text = text.trim();
        match element.value().attr("href").map(str::trim) {
            Some(href) if !href.is_empty() => {
                let label = if text.is_empty() { href } else { text };
                let href = link_destination(href);
                match element.value().attr("title").map(str::trim) {
                    Some(title) if !title.is_empty() => {
                        format!("[{label}]({href} \"{}\")", title.replace('"', "\\\""))
                    }
                    _ => format!("[{label}]({href})"),
                }
            }
            _ => text.to_string(),
        }
    }

    fn list(&self, element: ElementRef<'_>, ordered: bool) -> String {
        let start = element
            .value()
            .attr("start")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(1);
        let mut items = Vec::new();
        for item in element.children().filter_map(ElementRef::wrap) {
            if !item.value().name().eq_ignore_ascii_case("li") {
                continue;
            }
            let marker = if ordered {
                format!("{}. ", start + items.len())
            } else {
                "- ".to_string()
            };
            let content = BLANK_RUNS.replace_all(&tidy(&self.children(item)), "\n").into_owned();
            let content = content.trim().replace("\n\n", "\n");
            let indent = " ".repeat(marker.len());
            let mut lines = content.lines();
            let mut rendered = format!("{marker}{}", lines.next().unwrap_or(""));
            for line in lines {
                rendered.push('\n');
                if !line.is_empty() {
                    rendered.push_str(&indent);
                    rendered.push_str(line);
                }
            }
            items.push(rendered);
        }
        if items.is_empty() {
            return String::new();
        }
        block(&items.join("\n"))
    }

    fn table(&self, element: ElementRef<'_>) -> String {
        let mut rows: Vec<Vec<String>> = Vec::new();
        collect_rows(element, &mut |row| {
            let cells = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|cell| {
                    let name = cell.value().name();
                    name.eq_ignore_ascii_case("td") || name.eq_ignore_ascii_case("th")
                })
                .map(|cell| {
                    WHITESPACE
                        .replace_all(self.children(cell).trim(), " ")
                        .replace('|', "\\|")
                })
                .collect::<Vec<_>>();
            rows.push(cells);
        });
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        if width == 0 {
            return String::new();
        }

        let mut lines = Vec::with_capacity(rows.len() + 1);
        for (index, row) in rows.iter().enumerate() {
            let mut cells = row.clone();
            cells.resize(width, String::new());
            lines.push(format!("| {} |", cells.join(" | ")));
            if index == 0 {
                lines.push(format!("|{}", " --- |".repeat(width)));
            }
        }
        block(&lines.join("\n"))
    }
}

fn collect_rows(element: ElementRef<'_>, visit: &mut dyn FnMut(ElementRef<'_>)) {
    for child in element.children().filter_map(ElementRef::wrap) {
        let name = child.value().name().to_ascii_lowercase();
        match name.as_str() {
            "tr" => visit(child),
            "thead" | "tbody" | "tfoot" => collect_rows(child, visit),
            _ => {}
        }
    }
}

fn fenced(element: ElementRef<'_>) -> String {
    let text = element.text().collect::<String>();
    let text = text.trim_matches('\n');
    let language = element
        .children()
        .filter_map(ElementRef::wrap)
        .find(|child| child.value().name().eq_ignore_ascii_case("code"))
        .and_then(|code| code.value().attr("class"))
        .or_else(|| element.value().attr("class"))
        .and_then(|class| {
            class
                .split_whitespace()
                .find_map(|name| name.strip_prefix("language-"))
        })
        .unwrap_or("");
    let fence = if text.contains("```") { "~~~" } else { "```" };
    format!("\n\n{fence}{language}\n{text}\n{fence}\n\n")
}

fn image(element: ElementRef<'_>) -> String {
    let src = element.value().attr("src").unwrap_or("").trim();
    if src.is_empty() {
        return String::new();
    }
    let alt = element.value().attr("alt").unwrap_or("").trim();
    format!("![{alt}]({})", link_destination(src))
}

/// Link or image target as a Markdown destination. Targets with spaces,
/// parentheses or angle brackets are wrapped in `<...>`.
fn link_destination(target: &str) -> String {
    if !target
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '(' | ')' | '<' | '>'))
    {
        return target.to_string();
    }
    let escaped = target
        .replace('<', "%3C")
        .replace('>', "%3E")
        .replace(['\r', '\n'], "");
    format!("<{escaped}>")
}

fn block(content: &str) -> String {
    if content.trim().is_empty() {
        return String::new();
    }
    format!("\n\n{content}\n\n")
}

fn wrap_inline(content: &str, marker: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return content.to_string();
    }
    let leading = if content.starts_with(char::is_whitespace) { " " } else { "" };
    let trailing = if content.ends_with(char::is_whitespace) { " " } else { "" };
    format!("{leading}{marker}{trimmed}{marker}{trailing}")
}

/// Collapse blank-line runs and strip whitespace left over from inline text
/// nodes, leaving fenced code untouched.
fn tidy(raw: &str) -> String {
    let mut lines = Vec::new();
    let mut fence: Option<&str> = None;
    for line in raw.split('\n') {
        if let Some(marker) = fence {
            if line.starts_with(marker) {
                fence = None;
            }
            lines.push(line.to_string());
            continue;
        }
        if line.starts_with("```") {
            fence = Some("```");
        } else if line.starts_with("~~~") {
            fence = Some("~~~");
        }
        if line.trim().is_empty() {
            lines.push(String::new());
        } else if line.starts_with(' ') && !line.starts_with("  ") {
            lines.push(line[1..].to_string());
        } else {
            lines.push(line.to_string());
        }
    }
    let joined = lines.join("\n");
    let collapsed = BLANK_RUNS.replace_all(&joined, "\n\n");
    let trimmed = collapsed.trim_matches('\n');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{trimmed}\n")
}

#[cfg(test)]
mod tests {
    use super::{MarkdownOptions, UnknownTags, html_to_markdown, sanitize_html};

    fn convert(html: &str) -> String {
        html_to_markdown(html, &MarkdownOptions::default())
    }

    #[test]
    fn sanitize_unwraps_single_cell_pre_tables() {
        let html = r#"<p>x</p><table style="width: 100%;"><tbody><tr><td style="width: 100%;"><pre>jsh -s</pre></td></tr></tbody></table>"#;
        assert_eq!(sanitize_html(html), "<p>x</p><pre>jsh -s</pre>");

        let two_cells = "<table><tr><td><pre>a</pre></td><td><pre>b</pre></td></tr></table>";
        assert_eq!(sanitize_html(two_cells), two_cells);
    }

    #[test]
    fn converts_common_blocks_and_inlines() {
        let markdown = convert(
            "<h2>Install</h2>\n<p>Run <code>setup</code> as <strong>root</strong>, then\n see <a href=\"./../faq/\">the FAQ</a>.</p><hr><p><img src=\"./shot.png\" alt=\"Shot\"></p>",
        );
        assert_eq!(
            markdown,
            "## Install\n\nRun `setup` as **root**, then see [the FAQ](./../faq/).\n\n---\n\n![Shot](./shot.png)\n"
        );
    }

    #[test]
    fn targets_with_spaces_or_parentheses_are_bracketed() {
        let markdown = convert(
            r#"<p><a href="./release notes/">notes</a> <a href="https://example.com/wiki/Foo_(bar)">foo</a> <img src="./my shot.png" alt="x"></p>"#,
        );
        assert_eq!(
            markdown,
            "[notes](<./release notes/>) [foo](<https://example.com/wiki/Foo_(bar)>) ![x](<./my shot.png>)\n"
        );
    }

    #[test]
    fn preformatted_text_is_fenced_verbatim() {
        let markdown = convert("<p>Example:</p><pre>line one\n  indented &lt;tag&gt;</pre>");
        assert_eq!(
            markdown,
            "Example:\n\n```\nline one\n  indented <tag>\n```\n"
        );
    }

    #[test]
    fn nested_lists_are_indented() {
        let markdown =
            convert("<ul><li>one</li><li>two<ol><li>first</li><li>second</li></ol></li></ul>");
        assert_eq!(markdown, "- one\n- two\n  1. first\n  2. second\n");
    }

    #[test]
    fn tables_become_pipe_tables() {
        let markdown = convert(
            "<table><thead><tr><th>Name</th><th>Value</th></tr></thead><tbody><tr><td>a|b</td><td>1</td></tr></tbody></table>",
        );
        assert_eq!(markdown, "| Name | Value |\n| --- | --- |\n| a\\|b | 1 |\n");
    }

    #[test]
    fn unknown_tags_follow_the_configured_policy() {
        let html = "<p>before <kbd>Ctrl</kbd> after</p>";
        assert_eq!(convert(html), "before <kbd>Ctrl</kbd> after\n");

        let bypass = MarkdownOptions {
            unknown_tags: UnknownTags::Bypass,
        };
        assert_eq!(html_to_markdown(html, &bypass), "before Ctrl after\n");

        let drop = MarkdownOptions {
            unknown_tags: UnknownTags::Drop,
        };
        assert_eq!(html_to_markdown(html, &drop), "before  after\n");
    }
}
