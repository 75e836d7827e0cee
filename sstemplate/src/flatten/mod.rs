//! Rewrites a template tree with nested `cached` / `uncached` blocks into a
//! flat, ordered sequence of independent regions.
//!
//! Every region is a leaf: no region body contains another cache boundary.
//! Concatenating the region bodies in order yields exactly the original node
//! sequence with the wrapper tags removed, so caching never changes what is
//! rendered, only where it comes from.

use std::fmt;
use std::ops::Range;

use crate::expr::Expr;
use crate::node::{CacheBlock, TemplateNode};
use crate::parser::error::ParseError;

/// A region whose output may be served from the cache store.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRegion {
    pub key_exprs: Vec<Expr>,
    pub condition: Option<Expr>,
    pub negated: bool,
    /// Fingerprint of the originating block, shared by all of its segments.
    pub block_hash: String,
    /// Position of this piece among the regions cut from the same block.
    pub segment: usize,
    pub body: Vec<TemplateNode>,
    /// Span of the originating block.
    pub span: Range<usize>,
}

/// A region that is always rendered fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct PassthroughRegion {
    pub body: Vec<TemplateNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlattenedRegion {
    Cached(CachedRegion),
    Passthrough(PassthroughRegion),
}

impl FlattenedRegion {
    pub fn body(&self) -> &[TemplateNode] {
        match self {
            FlattenedRegion::Cached(region) => &region.body,
            FlattenedRegion::Passthrough(region) => &region.body,
        }
    }
}

/// Flatten `nodes` into regions.
///
/// Fails with one structural error per `cached` / `uncached` block found
/// inside a `loop` or `if` body.
pub fn flatten(nodes: &[TemplateNode], file_id: usize) -> Result<Vec<FlattenedRegion>, Vec<ParseError>> {
    let mut flattener = Flattener {
        regions: Vec::new(),
        pending: Vec::new(),
        errors: Vec::new(),
        file_id,
    };
    let mut root = Context::Passthrough;
    flattener.walk(nodes, &mut root);
    flattener.close(&mut root);

    if flattener.errors.is_empty() {
        Ok(flattener.regions)
    } else {
        Err(flattener.errors)
    }
}

/// The nearest enclosing cache boundary while walking.
enum Context<'b> {
    /// Top level, or inside `uncached`.
    Passthrough,
    Cached {
        block: &'b CacheBlock,
        next_segment: usize,
    },
}

struct Flattener {
    regions: Vec<FlattenedRegion>,
    /// Content collected for the region currently open.
    pending: Vec<TemplateNode>,
    errors: Vec<ParseError>,
    file_id: usize,
}

impl Flattener {
    fn walk<'b>(&mut self, nodes: &'b [TemplateNode], ctx: &mut Context<'b>) {
        for node in nodes {
            match node {
                TemplateNode::CacheBlock(block) => {
                    self.close(ctx);
                    let mut inner = Context::Cached {
                        block,
                        next_segment: 0,
                    };
                    self.walk(&block.body, &mut inner);
                    self.close(&mut inner);
                }
                TemplateNode::UncachedBlock { body, .. } => {
                    self.close(ctx);
                    let mut inner = Context::Passthrough;
                    self.walk(body, &mut inner);
                    self.close(&mut inner);
                }
                TemplateNode::Loop { body, span, .. } => {
                    self.reject_cache_boundaries(body, "loop", span);
                    self.pending.push(node.clone());
                }
                TemplateNode::Conditional {
                    then_body,
                    else_body,
                    span,
                    ..
                } => {
                    self.reject_cache_boundaries(then_body, "if", span);
                    self.reject_cache_boundaries(else_body, "if", span);
                    self.pending.push(node.clone());
                }
                TemplateNode::Text(_) | TemplateNode::Expression(_) => {
                    self.pending.push(node.clone());
                }
            }
        }
    }

    /// Emit the pending content as a region of the given context.
    fn close(&mut self, ctx: &mut Context<'_>) {
        if self.pending.is_empty() {
            return;
        }
        let body = std::mem::take(&mut self.pending);
        match ctx {
            Context::Passthrough => match self.regions.last_mut() {
                Some(FlattenedRegion::Passthrough(previous)) => previous.body.extend(body),
                _ => self
                    .regions
                    .push(FlattenedRegion::Passthrough(PassthroughRegion { body })),
            },
            Context::Cached {
                block,
                next_segment,
            } => {
                self.regions.push(FlattenedRegion::Cached(CachedRegion {
                    key_exprs: block.key_exprs.clone(),
                    condition: block.condition.clone(),
                    negated: block.negated,
                    block_hash: block.block_hash.clone(),
                    segment: *next_segment,
                    body,
                    span: block.span.clone(),
                }));
                *next_segment += 1;
            }
        }
    }

    fn reject_cache_boundaries(&mut self, body: &[TemplateNode], enclosing: &str, enclosing_span: &Range<usize>) {
        for node in body {
            match node {
                TemplateNode::CacheBlock(block) => {
                    let err = self.structural_error("cached", &block.span, enclosing, enclosing_span);
                    self.errors.push(err);
                }
                TemplateNode::UncachedBlock { span, .. } => {
                    let err = self.structural_error("uncached", span, enclosing, enclosing_span);
                    self.errors.push(err);
                }
                TemplateNode::Loop { body, .. } => {
                    self.reject_cache_boundaries(body, enclosing, enclosing_span);
                }
                TemplateNode::Conditional {
                    then_body,
                    else_body,
                    ..
                } => {
                    self.reject_cache_boundaries(then_body, enclosing, enclosing_span);
                    self.reject_cache_boundaries(else_body, enclosing, enclosing_span);
                }
                TemplateNode::Text(_) | TemplateNode::Expression(_) => {}
            }
        }
    }

    fn structural_error(
        &self,
        block: &str,
        span: &Range<usize>,
        enclosing: &str,
        enclosing_span: &Range<usize>,
    ) -> ParseError {
        ParseError::structural(
            format!("'{}' block inside '{}'", block, enclosing),
            span.clone(),
            self.file_id,
        )
        .with_note(format!(
            "the enclosing '{}' block spans {}..{}",
            enclosing, enclosing_span.start, enclosing_span.end
        ))
        .with_note("cache boundaries may not appear inside 'loop' or 'if'; move the block outside")
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for FlattenedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlattenedRegion::Cached(region) => {
                let keys: Vec<String> = region.key_exprs.iter().map(|k| k.to_string()).collect();
                write!(f, "cached({}", keys.join(", "))?;
                if let Some(condition) = &region.condition {
                    let word = if region.negated { "unless" } else { "if" };
                    if keys.is_empty() {
                        write!(f, "{} {}", word, condition)?;
                    } else {
                        write!(f, " {} {}", word, condition)?;
                    }
                }
                write!(f, ")#{}: ", region.segment)?;
                write_body(f, &region.body)
            }
            FlattenedRegion::Passthrough(region) => {
                write!(f, "passthrough: ")?;
                write_body(f, &region.body)
            }
        }
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &[TemplateNode]) -> fmt::Result {
    for node in body {
        write!(f, "{}", node)?;
    }
    Ok(())
}

/// Template-syntax form of a node. Cache wrappers print as their tags.
impl fmt::Display for TemplateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateNode::Text(s) => write!(f, "{}", s),
            TemplateNode::Expression(expr) => write!(f, "{{{}}}", expr),
            TemplateNode::Loop { path, body, .. } => {
                write!(f, "<% loop {} %>", path)?;
                write_body(f, body)?;
                write!(f, "<% end_loop %>")
            }
            TemplateNode::Conditional {
                condition,
                then_body,
                else_body,
                ..
            } => {
                write!(f, "<% if {} %>", condition)?;
                write_body(f, then_body)?;
                if !else_body.is_empty() {
                    write!(f, "<% else %>")?;
                    write_body(f, else_body)?;
                }
                write!(f, "<% end_if %>")
            }
            TemplateNode::CacheBlock(block) => {
                write!(f, "<% cached")?;
                let keys: Vec<String> = block.key_exprs.iter().map(|k| k.to_string()).collect();
                if !keys.is_empty() {
                    write!(f, " {}", keys.join(", "))?;
                }
                if let Some(condition) = &block.condition {
                    write!(f, " {} {}", if block.negated { "unless" } else { "if" }, condition)?;
                }
                write!(f, " %>")?;
                write_body(f, &block.body)?;
                write!(f, "<% end_cached %>")
            }
            TemplateNode::UncachedBlock { body, .. } => {
                write!(f, "<% uncached %>")?;
                write_body(f, body)?;
                write!(f, "<% end_uncached %>")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::unwrap_cache_blocks;
    use crate::parser::Parser;

    fn parse(source: &str) -> Vec<TemplateNode> {
        Parser::new(source.to_string(), 0).parse().expect("parse failed").nodes
    }

    fn describe(source: &str) -> Vec<String> {
        let nodes = parse(source);
        flatten(&nodes, 0)
            .expect("flatten failed")
            .iter()
            .map(|r| r.to_string())
            .collect()
    }

    fn concat_bodies(regions: &[FlattenedRegion]) -> Vec<TemplateNode> {
        regions.iter().flat_map(|r| r.body().to_vec()).collect()
    }

    #[test]
    fn single_block() {
        assert_eq!(describe("<% cached $A %>X<% end_cached %>"), vec!["cached($A)#0: X"]);
    }

    #[test]
    fn nested_cached_splits_outer_block() {
        assert_eq!(
            describe("<% cached $P %>H<% cached $B %>M<% end_cached %>F<% end_cached %>"),
            vec!["cached($P)#0: H", "cached($B)#0: M", "cached($P)#1: F"]
        );
    }

    #[test]
    fn uncached_becomes_passthrough() {
        assert_eq!(
            describe("<% cached $P %>H<% uncached %>U<% end_uncached %>F<% end_cached %>"),
            vec!["cached($P)#0: H", "passthrough: U", "cached($P)#1: F"]
        );
    }

    #[test]
    fn split_segments_share_block_identity() {
        let nodes = parse("<% cached $P if $On %>H<% cached $B %>M<% end_cached %>F<% end_cached %>");
        let regions = flatten(&nodes, 0).unwrap();
        let (FlattenedRegion::Cached(first), FlattenedRegion::Cached(last)) = (&regions[0], &regions[2]) else {
            panic!("expected cached regions");
        };
        assert_eq!(first.block_hash, last.block_hash);
        assert_eq!(first.key_exprs, last.key_exprs);
        assert_eq!(first.condition, last.condition);
        assert_ne!(first.segment, last.segment);
    }

    #[test]
    fn text_outside_blocks_is_passthrough_and_merged() {
        assert_eq!(
            describe("A<% uncached %>B<% end_uncached %>C<% cached %>D<% end_cached %>E"),
            vec!["passthrough: ABC", "cached()#0: D", "passthrough: E"]
        );
    }

    #[test]
    fn empty_pieces_are_not_emitted() {
        assert_eq!(
            describe("<% cached $P %><% cached $B %>M<% end_cached %><% end_cached %>"),
            vec!["cached($B)#0: M"]
        );
    }

    #[test]
    fn cached_inside_uncached_is_its_own_region() {
        assert_eq!(
            describe("<% cached $P %>a<% uncached %>b<% cached $Q %>c<% end_cached %>d<% end_uncached %>e<% end_cached %>"),
            vec![
                "cached($P)#0: a",
                "passthrough: b",
                "cached($Q)#0: c",
                "passthrough: d",
                "cached($P)#1: e",
            ]
        );
    }

    #[test]
    fn loops_and_conditionals_stay_inside_regions() {
        assert_eq!(
            describe("<% cached unless $Admin %><% loop $Items %>$Title<% end_loop %><% end_cached %>"),
            vec!["cached(unless $Admin)#0: <% loop $Items %>{$Title}<% end_loop %>"]
        );
    }

    #[test]
    fn concatenated_bodies_equal_unwrapped_template() {
        let sources = [
            "<% cached $P %>H<% cached $B %>M<% end_cached %>F<% end_cached %>",
            "x<% cached $P %>H<% uncached %>U<% cached $C %>V<% end_cached %><% end_uncached %>F<% end_cached %>y",
            "<% if $A %>a<% else %>b<% end_if %><% cached %>$Z<% end_cached %>",
            "plain $Text only",
        ];
        for source in sources {
            let nodes = parse(source);
            let regions = flatten(&nodes, 0).unwrap();
            assert_eq!(concat_bodies(&regions), unwrap_cache_blocks(&nodes), "source: {}", source);
            for region in &regions {
                assert!(!region.body().iter().any(TemplateNode::is_cache_boundary));
            }
        }
    }

    #[test]
    fn cached_inside_loop_is_structural_error() {
        let source = "<% loop $Items %><% cached $X %>Y<% end_cached %><% end_loop %>";
        let errors = flatten(&parse(source), 0).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_structural());
        assert_eq!(&source[errors[0].span.clone()], "<% cached $X %>Y<% end_cached %>");
    }

    #[test]
    fn uncached_deep_inside_conditional_is_structural_error() {
        let source = "<% cached %><% if $A %><% loop $B %><% uncached %>u<% end_uncached %><% end_loop %><% end_if %><% end_cached %>";
        let errors = flatten(&parse(source), 0).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("'uncached' block inside 'if'"));
    }

    #[test]
    fn every_offending_block_is_reported() {
        let source = "<% loop $A %><% cached %>1<% end_cached %><% end_loop %><% if $B %>x<% else %><% cached %>2<% end_cached %><% end_if %>";
        let errors = flatten(&parse(source), 0).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
