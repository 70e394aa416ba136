//! Fenced code block scanning for model output.
//!
//! Markdown is parsed into block structure first ([`fenced_blocks`]) and code
//! blocks are filtered by info-string language afterwards. Both artifact
//! extraction and tool-call parsing go through this scanner so nested or
//! malformed fences are handled by one CommonMark parser, not by ad hoc regexes.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

/// A fenced code block found in a markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// First word of the info string, as written (`None` for a bare fence).
    /// Language matching is case-insensitive; tool fences match exactly.
    pub lang: Option<String>,
    /// Raw block body, without the fence lines.
    pub body: String,
}

const LANG_ALIASES: &[&[&str]] = &[
    &["javascript", "js"],
    &["typescript", "ts"],
    &["python", "py"],
    &["bash", "sh", "shell"],
    &["rust", "rs"],
];

/// Return every fenced code block in document order. Indented code blocks are ignored.
pub fn fenced_blocks(markdown: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;

    for event in Parser::new_ext(markdown, Options::empty()) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let lang = info.split_whitespace().next().map(str::to_string);
                current = Some(FencedBlock {
                    lang,
                    body: String::new(),
                });
            }
            Event::Text(text) => {
                if let Some(block) = current.as_mut() {
                    block.body.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
            }
            _ => {}
        }
    }

    blocks
}

/// True if a block tagged `block_lang` satisfies a request for `wanted` (alias-aware).
pub fn matches_language(wanted: &str, block_lang: &str) -> bool {
    let wanted = wanted.trim().to_ascii_lowercase();
    let block_lang = block_lang.trim().to_ascii_lowercase();
    if wanted == block_lang {
        return true;
    }
    LANG_ALIASES.iter().any(|aliases| {
        aliases.contains(&wanted.as_str()) && aliases.contains(&block_lang.as_str())
    })
}

/// Extract the first non-empty code block written in `lang`, trimmed.
pub fn extract_code(markdown: &str, lang: &str) -> Option<String> {
    fenced_blocks(markdown)
        .into_iter()
        .filter(|block| {
            block
                .lang
                .as_deref()
                .is_some_and(|block_lang| matches_language(lang, block_lang))
        })
        .map(|block| block.body.trim().to_string())
        .find(|code| !code.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_blocks_in_document_order() {
        let md = "intro\n\n```python\nprint(1)\n```\n\ntext\n\n```\nplain\n```\n";
        let blocks = fenced_blocks(md);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lang.as_deref(), Some("python"));
        assert_eq!(blocks[0].body, "print(1)\n");
        assert_eq!(blocks[1].lang, None);
    }

    #[test]
    fn longer_fence_keeps_inner_backticks_in_body() {
        let md = "````markdown\n```js\nconsole.log(1)\n```\n````\n";
        let blocks = fenced_blocks(md);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang.as_deref(), Some("markdown"));
        assert!(blocks[0].body.contains("```js"));
    }

    #[test]
    fn extract_code_matches_aliases() {
        let md = "```ts\nconst x: number = 1;\n```\n";
        assert_eq!(
            extract_code(md, "typescript").as_deref(),
            Some("const x: number = 1;")
        );
        assert_eq!(extract_code(md, "ts").as_deref(), Some("const x: number = 1;"));
        assert_eq!(extract_code(md, "python"), None);
    }

    #[test]
    fn extract_code_skips_empty_blocks() {
        let md = "```sh\n\n```\n\n```bash\necho hi\n```\n";
        assert_eq!(extract_code(md, "sh").as_deref(), Some("echo hi"));
    }

    #[test]
    fn info_string_attributes_are_ignored() {
        let md = "```Python title=\"main.py\"\nprint(2)\n```\n";
        assert_eq!(extract_code(md, "py").as_deref(), Some("print(2)"));
    }
}
