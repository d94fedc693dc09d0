//! Link tokens embedded in document field content
//!
//! Field content is free text interleaved with `{{...}}` tokens:
//!
//! ```text
//! {{link:12}}                 hyperlink to node 12
//! {{attachment:7}}            embedded media, resolved by time
//! {{attachment:7@2}}          embedded media, binary version 2
//! {{nfs:labstore:/data/a.csv}} external filestore path
//! {{url:https://host/x}}      absolute URL
//! {{ref:3}}                   bundle-local hyperlink to unit 3
//! {{media:4@1}}               bundle-local attachment, unit 4 version 1
//! ```
//!
//! Anything that does not parse as a token is kept verbatim as text, so
//! `render(parse(s)) == s` for every input.

use crate::types::{MediaVersionNumber, NodeId};
use std::fmt;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A recognized link token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    /// Hyperlink to a node of the current instance
    Link(NodeId),
    /// Embedded media file
    Attachment {
        /// Media node
        media: NodeId,
        /// Pinned binary version
        version: Option<MediaVersionNumber>,
    },
    /// File or folder on an external filestore
    Nfs {
        /// Filestore name
        filestore: String,
        /// Path inside the filestore
        path: String,
    },
    /// Absolute URL
    Url(String),
    /// Bundle-local hyperlink
    Ref(u64),
    /// Bundle-local attachment
    Media {
        /// Unit sequence number of the media file
        seq: u64,
        /// Binary version inside the bundle
        version: MediaVersionNumber,
    },
}

impl Token {
    fn parse(inner: &str) -> Option<Token> {
        let (tag, rest) = inner.split_once(':')?;
        match tag {
            "link" => number(rest).map(|id| Token::Link(NodeId(id))),
            "attachment" => match rest.split_once('@') {
                Some((id, version)) => Some(Token::Attachment {
                    media: NodeId(number(id)?),
                    version: Some(number(version)?),
                }),
                None => Some(Token::Attachment {
                    media: NodeId(number(rest)?),
                    version: None,
                }),
            },
            "nfs" => {
                let (filestore, path) = rest.split_once(':')?;
                if filestore.is_empty() || path.is_empty() {
                    return None;
                }
                Some(Token::Nfs {
                    filestore: filestore.to_string(),
                    path: path.to_string(),
                })
            }
            "url" if !rest.is_empty() => Some(Token::Url(rest.to_string())),
            "ref" => number(rest).map(Token::Ref),
            "media" => {
                let (seq, version) = rest.split_once('@')?;
                Some(Token::Media {
                    seq: number(seq)?,
                    version: number(version)?,
                })
            }
            _ => None,
        }
    }
}

/// Canonical decimal only: no sign, no leading zeros
fn number<N: std::str::FromStr>(s: &str) -> Option<N> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    if canonical {
        s.parse().ok()
    } else {
        None
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Link(id) => write!(f, "{{{{link:{}}}}}", id),
            Token::Attachment {
                media,
                version: Some(v),
            } => write!(f, "{{{{attachment:{}@{}}}}}", media, v),
            Token::Attachment {
                media,
                version: None,
            } => write!(f, "{{{{attachment:{}}}}}", media),
            Token::Nfs { filestore, path } => write!(f, "{{{{nfs:{}:{}}}}}", filestore, path),
            Token::Url(url) => write!(f, "{{{{url:{}}}}}", url),
            Token::Ref(seq) => write!(f, "{{{{ref:{}}}}}", seq),
            Token::Media { seq, version } => write!(f, "{{{{media:{}@{}}}}}", seq, version),
        }
    }
}

/// A piece of parsed content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Literal text
    Text(&'a str),
    /// Link token
    Token(Token),
}

/// Split content into text and tokens
pub fn parse(content: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = content;
    let mut text_start = 0usize;
    let mut offset = 0usize;

    while let Some(open) = rest.find(OPEN) {
        let after_open = &rest[open + OPEN.len()..];
        let Some(close) = after_open.find(CLOSE) else {
            break;
        };
        let inner = &after_open[..close];
        let token_start = offset + open;
        let token_end = token_start + OPEN.len() + close + CLOSE.len();

        match Token::parse(inner) {
            Some(token) => {
                if text_start < token_start {
                    segments.push(Segment::Text(&content[text_start..token_start]));
                }
                segments.push(Segment::Token(token));
                text_start = token_end;
                offset = token_end;
            }
            None => {
                // Not a token: resume scanning just past this "{{"
                offset = token_start + 1;
            }
        }
        rest = &content[offset..];
    }

    if text_start < content.len() {
        segments.push(Segment::Text(&content[text_start..]));
    }
    segments
}

/// Collect every token in content, in order of appearance
pub fn tokens(content: &str) -> Vec<Token> {
    parse(content)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Token(t) => Some(t),
            Segment::Text(_) => None,
        })
        .collect()
}

/// Reassemble content from segments
pub fn render(segments: &[Segment<'_>]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Token(token) => out.push_str(&token.to_string()),
        }
    }
    out
}

/// Replace every token with the string produced by `f`
///
/// Text between tokens is passed through `text` unchanged, which lets
/// renderers escape it.
pub fn map_content<F, T>(content: &str, mut text: T, mut f: F) -> String
where
    F: FnMut(&Token) -> String,
    T: FnMut(&str) -> String,
{
    let mut out = String::with_capacity(content.len());
    for segment in parse(content) {
        match segment {
            Segment::Text(t) => out.push_str(&text(t)),
            Segment::Token(token) => out.push_str(&f(&token)),
        }
    }
    out
}

/// Rewrite tokens, leaving text untouched
pub fn rewrite_tokens<F>(content: &str, mut f: F) -> String
where
    F: FnMut(&Token) -> Token,
{
    map_content(content, str::to_string, |t| f(t).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_all_token_kinds() {
        let content = "see {{link:12}} and {{attachment:7@2}} {{attachment:8}} \
                       {{nfs:lab:/a/b.csv}} {{url:https://x.org/SD1}} {{ref:3}} {{media:4@1}}";
        let toks = tokens(content);
        assert_eq!(
            toks,
            vec![
                Token::Link(NodeId(12)),
                Token::Attachment {
                    media: NodeId(7),
                    version: Some(2)
                },
                Token::Attachment {
                    media: NodeId(8),
                    version: None
                },
                Token::Nfs {
                    filestore: "lab".into(),
                    path: "/a/b.csv".into()
                },
                Token::Url("https://x.org/SD1".into()),
                Token::Ref(3),
                Token::Media { seq: 4, version: 1 },
            ]
        );
    }

    #[test]
    fn test_malformed_tokens_stay_text() {
        let content = "{{link:abc}} {{unknown:1}} {{ref:}} {{ref:07}} {{link:+1}} {{ {{link:5}}";
        let segments = parse(content);
        assert_eq!(tokens(content), vec![Token::Link(NodeId(5))]);
        assert_eq!(render(&segments), content);
    }

    #[test]
    fn test_unterminated_token() {
        let content = "text {{link:5";
        assert!(tokens(content).is_empty());
        assert_eq!(render(&parse(content)), content);
    }

    #[test]
    fn test_rewrite_tokens() {
        let out = rewrite_tokens("a {{link:1}} b {{link:2}}", |t| match t {
            Token::Link(NodeId(1)) => Token::Ref(10),
            other => other.clone(),
        });
        assert_eq!(out, "a {{ref:10}} b {{link:2}}");
    }

    #[test]
    fn test_map_content_escapes_text_only() {
        let out = map_content(
            "<b> {{ref:1}}",
            |t| t.replace('<', "&lt;").replace('>', "&gt;"),
            |_| "<a>".to_string(),
        );
        assert_eq!(out, "&lt;b&gt; <a>");
    }

    proptest! {
        #[test]
        fn prop_render_parse_is_identity(s in "[a-z{}:@0-9 /.]{0,64}") {
            prop_assert_eq!(render(&parse(&s)), s);
        }
    }
}
