use std::ops::Range;

use crate::expr::Expr;
use crate::fingerprint::fingerprint;
use crate::node::{CacheBlock, TemplateNode};
use crate::parser::error::ParseError;
use crate::parser::expression::{self, CacheArguments};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse template source into a node tree.
pub fn parse_nodes(source: &str, file_id: usize) -> Result<Vec<TemplateNode>, Vec<ParseError>> {
    let mut state = ParseState::new(source, file_id);
    state.scan();
    state.finalize()
}

// ---------------------------------------------------------------------------
// Parse state
// ---------------------------------------------------------------------------

struct ParseState<'a> {
    source: &'a str,
    file_id: usize,
    /// Stack of open blocks. The bottom frame is the template root.
    frame_stack: Vec<Frame>,
    /// Literal text not yet pushed as a node.
    text: String,
    errors: Vec<ParseError>,
}

struct Frame {
    kind: FrameKind,
    nodes: Vec<TemplateNode>,
    /// Span of the opening tag.
    open_span: Range<usize>,
}

enum FrameKind {
    Root,
    Loop {
        path: Expr,
    },
    If {
        /// Completed `if` / `else_if` branches.
        branches: Vec<(Expr, Vec<TemplateNode>)>,
        /// Condition of the branch being collected; None once inside `else`.
        condition: Option<Expr>,
    },
    Cached {
        tag: &'static str,
        arguments: CacheArguments,
    },
    Uncached,
}

impl FrameKind {
    fn tag_name(&self) -> &'static str {
        match self {
            FrameKind::Root => "template",
            FrameKind::Loop { .. } => "loop",
            FrameKind::If { .. } => "if",
            FrameKind::Cached { tag, .. } => tag,
            FrameKind::Uncached => "uncached",
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Closing {
    Loop,
    If,
    Cached,
    Uncached,
}

impl Closing {
    fn matches(self, kind: &FrameKind) -> bool {
        matches!(
            (self, kind),
            (Closing::Loop, FrameKind::Loop { .. })
                | (Closing::If, FrameKind::If { .. })
                | (Closing::Cached, FrameKind::Cached { .. })
                | (Closing::Uncached, FrameKind::Uncached)
        )
    }
}

impl<'a> ParseState<'a> {
    fn new(source: &'a str, file_id: usize) -> Self {
        ParseState {
            source,
            file_id,
            frame_stack: vec![Frame {
                kind: FrameKind::Root,
                nodes: Vec::new(),
                open_span: 0..0,
            }],
            text: String::new(),
            errors: Vec::new(),
        }
    }

    fn scan(&mut self) {
        let source = self.source;
        let mut pos = 0;

        while pos < source.len() {
            let rest = &source[pos..];

            if rest.starts_with("<%--") {
                match rest.find("--%>") {
                    Some(end) => pos += end + 4,
                    None => {
                        self.errors.push(ParseError::error(
                            "unclosed comment",
                            pos..source.len(),
                            self.file_id,
                        ));
                        return;
                    }
                }
            } else if rest.starts_with("<%") {
                let Some(end) = rest[2..].find("%>") else {
                    self.errors.push(
                        ParseError::error("unclosed tag", pos..source.len(), self.file_id)
                            .with_note("tags are closed with '%>'"),
                    );
                    return;
                };
                self.flush_text();
                let contents = &rest[2..2 + end];
                let tag_span = pos..pos + 2 + end + 2;
                self.handle_tag(contents, pos + 2, tag_span.clone());
                pos = tag_span.end;
            } else if rest.starts_with("\\$") {
                self.text.push('$');
                pos += 2;
            } else if rest.starts_with("{$") {
                match rest.find('}') {
                    Some(close) => {
                        self.flush_text();
                        match expression::parse_expression(&rest[1..close], pos + 1, self.file_id) {
                            Ok(expr) => self.push_node(TemplateNode::Expression(expr)),
                            Err(err) => self.errors.push(err),
                        }
                        pos += close + 1;
                    }
                    None => {
                        self.text.push('{');
                        pos += 1;
                    }
                }
            } else if rest.starts_with('$') {
                let len = expression::field_reference_len(rest);
                if len == 0 {
                    self.text.push('$');
                    pos += 1;
                } else {
                    self.flush_text();
                    let segments: Vec<&str> = rest[1..len].split('.').collect();
                    self.push_node(TemplateNode::Expression(Expr::path(&segments, pos..pos + len)));
                    pos += len;
                }
            } else {
                let ch = rest.chars().next().unwrap_or_default();
                self.text.push(ch);
                pos += ch.len_utf8().max(1);
            }
        }

        self.flush_text();
    }

    /// Dispatch a `<% ... %>` tag. `contents_offset` is the byte offset of
    /// `contents` in the source.
    fn handle_tag(&mut self, contents: &str, contents_offset: usize, tag_span: Range<usize>) {
        let leading = contents.len() - contents.trim_start().len();
        let trimmed = contents.trim();
        let word_len = trimmed
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(trimmed.len());
        let word = &trimmed[..word_len];
        let args = &trimmed[word_len..];
        let args_offset = contents_offset + leading + word_len;

        match word {
            "loop" => {
                let path = self.parse_argument(args, args_offset, &tag_span, "loop");
                self.open(FrameKind::Loop { path }, tag_span);
            }
            "end_loop" => self.close(Closing::Loop, word, tag_span),

            "if" => {
                let condition = self.parse_argument(args, args_offset, &tag_span, "if");
                self.open(
                    FrameKind::If {
                        branches: Vec::new(),
                        condition: Some(condition),
                    },
                    tag_span,
                );
            }
            "else_if" => {
                let next = self.parse_argument(args, args_offset, &tag_span, "else_if");
                self.next_branch(Some(next), word, tag_span);
            }
            "else" => self.next_branch(None, word, tag_span),
            "end_if" => self.close(Closing::If, word, tag_span),

            "cached" | "cacheblock" => {
                let tag = if word == "cached" { "cached" } else { "cacheblock" };
                let arguments = match expression::parse_cache_arguments(args, args_offset, self.file_id) {
                    Ok(arguments) => arguments,
                    Err(err) => {
                        self.errors.push(err);
                        CacheArguments {
                            key_exprs: Vec::new(),
                            condition: None,
                            negated: false,
                        }
                    }
                };
                self.open(FrameKind::Cached { tag, arguments }, tag_span);
            }
            "end_cached" | "end_cacheblock" => self.close(Closing::Cached, word, tag_span),

            // Arguments of `uncached` are accepted and ignored.
            "uncached" => self.open(FrameKind::Uncached, tag_span),
            "end_uncached" => self.close(Closing::Uncached, word, tag_span),

            "" => self.errors.push(ParseError::error("empty tag", tag_span, self.file_id)),
            other => self.errors.push(
                ParseError::error(format!("unknown tag '{}'", other), tag_span, self.file_id)
                    .with_note("supported tags: loop, if, else_if, else, cached, cacheblock, uncached"),
            ),
        }
    }

    /// Parse a required single-expression tag argument. On failure the error
    /// is recorded and a placeholder is returned so block nesting stays balanced.
    fn parse_argument(&mut self, args: &str, offset: usize, tag_span: &Range<usize>, tag: &str) -> Expr {
        if args.trim().is_empty() {
            self.errors.push(ParseError::error(
                format!("'{}' requires an argument", tag),
                tag_span.clone(),
                self.file_id,
            ));
            return Expr::Null;
        }
        match expression::parse_expression(args, offset, self.file_id) {
            Ok(expr) => expr,
            Err(err) => {
                self.errors.push(err);
                Expr::Null
            }
        }
    }

    fn open(&mut self, kind: FrameKind, open_span: Range<usize>) {
        self.frame_stack.push(Frame {
            kind,
            nodes: Vec::new(),
            open_span,
        });
    }

    fn next_branch(&mut self, next: Option<Expr>, word: &str, tag_span: Range<usize>) {
        let file_id = self.file_id;
        let Some(frame) = self.frame_stack.last_mut() else {
            return;
        };
        match &mut frame.kind {
            FrameKind::If { branches, condition } => match condition.take() {
                Some(current) => {
                    branches.push((current, std::mem::take(&mut frame.nodes)));
                    *condition = next;
                }
                None => self.errors.push(ParseError::error(
                    format!("'{}' after 'else'", word),
                    tag_span,
                    file_id,
                )),
            },
            other => {
                let inside = other.tag_name();
                self.errors.push(
                    ParseError::error(format!("'{}' outside of an 'if' block", word), tag_span, file_id)
                        .with_note(format!("the innermost open block is '{}'", inside)),
                );
            }
        }
    }

    fn close(&mut self, closing: Closing, word: &str, tag_span: Range<usize>) {
        let top_matches = self
            .frame_stack
            .last()
            .is_some_and(|frame| closing.matches(&frame.kind));

        if !top_matches || self.frame_stack.len() < 2 {
            let mut err = ParseError::error(format!("unexpected '{}'", word), tag_span, self.file_id);
            if let Some(frame) = self.frame_stack.last().filter(|f| !matches!(f.kind, FrameKind::Root)) {
                err = err.with_note(format!(
                    "the innermost open block is '{}', opened at {}..{}",
                    frame.kind.tag_name(),
                    frame.open_span.start,
                    frame.open_span.end
                ));
            }
            self.errors.push(err);
            return;
        }

        let Some(frame) = self.frame_stack.pop() else {
            return;
        };
        let span = frame.open_span.start..tag_span.end;
        let node = match frame.kind {
            FrameKind::Loop { path } => TemplateNode::Loop {
                path,
                body: frame.nodes,
                span,
            },
            FrameKind::If {
                mut branches,
                condition,
            } => {
                let else_body = match condition {
                    Some(current) => {
                        branches.push((current, frame.nodes));
                        Vec::new()
                    }
                    None => frame.nodes,
                };
                build_conditional(branches, else_body, span)
            }
            FrameKind::Cached { arguments, .. } => TemplateNode::CacheBlock(CacheBlock {
                key_exprs: arguments.key_exprs,
                condition: arguments.condition,
                negated: arguments.negated,
                body: frame.nodes,
                block_hash: fingerprint(&self.source[span.clone()]),
                span,
            }),
            FrameKind::Uncached => TemplateNode::UncachedBlock {
                body: frame.nodes,
                span,
            },
            FrameKind::Root => return,
        };
        self.push_node(node);
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.push_node(TemplateNode::Text(text));
        }
    }

    fn push_node(&mut self, node: TemplateNode) {
        if let Some(frame) = self.frame_stack.last_mut() {
            frame.nodes.push(node);
        }
    }

    fn finalize(mut self) -> Result<Vec<TemplateNode>, Vec<ParseError>> {
        while self.frame_stack.len() > 1 {
            if let Some(frame) = self.frame_stack.pop() {
                let tag = frame.kind.tag_name();
                self.errors.push(
                    ParseError::error(format!("unclosed '{}' block", tag), frame.open_span, self.file_id)
                        .with_note(format!("expected '<% end_{} %>'", tag)),
                );
            }
        }

        if self.errors.is_empty() {
            Ok(self.frame_stack.pop().map(|root| root.nodes).unwrap_or_default())
        } else {
            Err(self.errors)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fold `if` / `else_if` branches into nested Conditionals, innermost last.
fn build_conditional(
    branches: Vec<(Expr, Vec<TemplateNode>)>,
    else_body: Vec<TemplateNode>,
    span: Range<usize>,
) -> TemplateNode {
    let mut acc = else_body;
    for (condition, then_body) in branches.into_iter().rev() {
        acc = vec![TemplateNode::Conditional {
            condition,
            then_body,
            else_body: acc,
            span: span.clone(),
        }];
    }
    acc.pop().unwrap_or(TemplateNode::Text(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<TemplateNode> {
        parse_nodes(source, 0).expect("parse failed")
    }

    #[test]
    fn text_and_fields() {
        let nodes = parse("Hello $Name.First, {$Greeting}!");
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0], TemplateNode::text("Hello "));
        assert_eq!(nodes[1], TemplateNode::Expression(Expr::path(&["Name", "First"], 6..17)));
        assert_eq!(nodes[2], TemplateNode::text(", "));
        assert!(matches!(&nodes[3], TemplateNode::Expression(Expr::Path(p, _)) if p.head() == "Greeting"));
        assert_eq!(nodes[4], TemplateNode::text("!"));
    }

    #[test]
    fn escaped_dollar_and_comments() {
        let nodes = parse("costs \\$5<%-- hidden --%> each");
        assert_eq!(nodes, vec![TemplateNode::text("costs $5 each")]);
    }

    #[test]
    fn trailing_dot_is_text() {
        let nodes = parse("by $Author.");
        assert_eq!(nodes[1], TemplateNode::Expression(Expr::path(&["Author"], 3..10)));
        assert_eq!(nodes[2], TemplateNode::text("."));
    }

    #[test]
    fn nested_cache_blocks() {
        let source = "<% cached $P %>H<% cached $B %>M<% end_cached %>F<% end_cached %>";
        let nodes = parse(source);
        assert_eq!(nodes.len(), 1);
        let TemplateNode::CacheBlock(outer) = &nodes[0] else {
            panic!("expected cache block");
        };
        assert_eq!(outer.span, 0..source.len());
        assert_eq!(outer.block_hash, fingerprint(source));
        assert_eq!(outer.body.len(), 3);
        let TemplateNode::CacheBlock(inner) = &outer.body[1] else {
            panic!("expected nested cache block");
        };
        assert_eq!(inner.key_exprs[0].to_string(), "$B");
        assert_eq!(inner.block_hash, fingerprint("<% cached $B %>M<% end_cached %>"));
    }

    #[test]
    fn cacheblock_alias_and_uncached_arguments() {
        let nodes = parse("<% cacheblock 'x' unless $Admin %>A<% uncached $Ignored %>B<% end_uncached %><% end_cacheblock %>");
        let TemplateNode::CacheBlock(block) = &nodes[0] else {
            panic!("expected cache block");
        };
        assert!(block.negated);
        assert!(matches!(block.body[1], TemplateNode::UncachedBlock { .. }));
    }

    #[test]
    fn if_else_if_else_chain() {
        let nodes = parse("<% if $A %>a<% else_if $B %>b<% else %>c<% end_if %>");
        let TemplateNode::Conditional { then_body, else_body, .. } = &nodes[0] else {
            panic!("expected conditional");
        };
        assert_eq!(then_body, &vec![TemplateNode::text("a")]);
        let TemplateNode::Conditional { condition, then_body, else_body, .. } = &else_body[0] else {
            panic!("expected nested conditional");
        };
        assert_eq!(condition.to_string(), "$B");
        assert_eq!(then_body, &vec![TemplateNode::text("b")]);
        assert_eq!(else_body, &vec![TemplateNode::text("c")]);
    }

    #[test]
    fn loop_block() {
        let nodes = parse("<% loop $Items %>[$Title]<% end_loop %>");
        let TemplateNode::Loop { path, body, span } = &nodes[0] else {
            panic!("expected loop");
        };
        assert_eq!(path.to_string(), "$Items");
        assert_eq!(body.len(), 3);
        assert_eq!(span.start, 0);
    }

    #[test]
    fn mismatched_end_tag() {
        let errors = parse_nodes("<% loop $Items %>x<% end_if %>", 0).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("unexpected 'end_if'")));
        assert!(errors.iter().any(|e| e.message.contains("unclosed 'loop'")));
    }

    #[test]
    fn unknown_tag_and_unclosed_tag() {
        let errors = parse_nodes("<% include Footer %> <% if $A", 0).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("unknown tag 'include'"));
        assert!(errors[1].message.contains("unclosed tag"));
    }

    #[test]
    fn else_outside_if() {
        let errors = parse_nodes("<% cached %><% else %><% end_cached %>", 0).unwrap_err();
        assert!(errors[0].message.contains("outside of an 'if'"));
    }

    #[test]
    fn loop_requires_argument() {
        let errors = parse_nodes("<% loop %><% end_loop %>", 0).unwrap_err();
        assert!(errors[0].message.contains("requires an argument"));
    }

    #[test]
    fn nesting_under_loop_is_left_to_the_flattener() {
        let nodes = parse("<% loop $Items %><% cached $X %>Y<% end_cached %><% end_loop %>");
        assert!(matches!(nodes[0], TemplateNode::Loop { .. }));
    }
}
