use std::ops::Range;

use crate::expr::Expr;

/// A `<% cached ... %>` block as written in the template.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheBlock {
    /// Key expressions, in declared order. May be empty.
    pub key_exprs: Vec<Expr>,
    /// `if` / `unless` condition. Absent means "always cache".
    pub condition: Option<Expr>,
    /// True for `unless`.
    pub negated: bool,
    pub body: Vec<TemplateNode>,
    /// Fingerprint of the block's full source text, opening tag through closing tag.
    pub block_hash: String,
    /// Byte span in source for error reporting.
    pub span: Range<usize>,
}

/// A single node of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    /// Literal text, emitted verbatim.
    Text(String),
    /// `$Field` / `{$Field}` interpolation.
    Expression(Expr),
    /// `<% loop $Items %> ... <% end_loop %>`
    Loop {
        path: Expr,
        body: Vec<TemplateNode>,
        span: Range<usize>,
    },
    /// `<% if %> ... <% else %> ... <% end_if %>`. An `else_if` chain is a
    /// nested Conditional as the only node of `else_body`.
    Conditional {
        condition: Expr,
        then_body: Vec<TemplateNode>,
        else_body: Vec<TemplateNode>,
        span: Range<usize>,
    },
    CacheBlock(CacheBlock),
    /// `<% uncached %> ... <% end_uncached %>`
    UncachedBlock {
        body: Vec<TemplateNode>,
        span: Range<usize>,
    },
}

impl TemplateNode {
    pub fn text(s: impl Into<String>) -> Self {
        TemplateNode::Text(s.into())
    }

    /// Whether this node is a `cached` or `uncached` wrapper.
    pub fn is_cache_boundary(&self) -> bool {
        matches!(
            self,
            TemplateNode::CacheBlock(_) | TemplateNode::UncachedBlock { .. }
        )
    }

    pub fn span(&self) -> Option<&Range<usize>> {
        match self {
            TemplateNode::Loop { span, .. }
            | TemplateNode::Conditional { span, .. }
            | TemplateNode::UncachedBlock { span, .. } => Some(span),
            TemplateNode::CacheBlock(block) => Some(&block.span),
            TemplateNode::Text(_) | TemplateNode::Expression(_) => None,
        }
    }
}

/// Strip every `cached` / `uncached` wrapper, keeping their contents in place.
pub fn unwrap_cache_blocks(nodes: &[TemplateNode]) -> Vec<TemplateNode> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            TemplateNode::CacheBlock(block) => out.extend(unwrap_cache_blocks(&block.body)),
            TemplateNode::UncachedBlock { body, .. } => out.extend(unwrap_cache_blocks(body)),
            other => out.push(other.clone()),
        }
    }
    out
}
