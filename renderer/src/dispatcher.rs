use std::collections::BTreeMap;
use std::sync::Arc;

use sstemplate::CompiledTemplate;
use sstemplate::expr::Expr;
use sstemplate::flatten::{CachedRegion, FlattenedRegion};
use sstemplate::node::TemplateNode;
use tracing::{debug, warn};

use crate::config::{ConfigError, RenderConfig, StoreFailurePolicy};
use crate::environment::Environment;
use crate::error::{DiagnosticError, RuntimeError};
use crate::evaluator::{ExpressionMemo, Lookup};
use crate::key::{CacheKeyMaterial, compose_key};
use crate::runtime_value::RuntimeValue;
use crate::store::{CacheStore, StoreError};

/// Separator between the values of the global key expressions.
const GLOBAL_KEY_SEPARATOR: &str = ", ";

/// Counters collected during one render pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderStats {
    /// Expressions actually evaluated (memo misses).
    pub evaluations: usize,
    pub memo_hits: usize,
    /// Evaluation count per canonical expression text.
    pub evaluated: BTreeMap<String, usize>,
    pub store_gets: usize,
    pub store_sets: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Cached regions rendered directly because their condition was false.
    pub skipped_regions: usize,
    /// Store errors absorbed under [`StoreFailurePolicy::Degrade`].
    pub store_failures: usize,
}

#[derive(Debug)]
pub struct RenderOutput {
    pub text: String,
    /// Non-fatal problems, such as degraded store failures.
    pub warnings: Vec<DiagnosticError>,
    pub stats: RenderStats,
}

/// Renders compiled templates against a shared cache store.
///
/// A `Renderer` holds no per-render state; it can be shared between threads
/// and every call to [`Renderer::render`] runs an independent pass.
pub struct Renderer {
    config: RenderConfig,
    global_key: Vec<Expr>,
    store: Arc<dyn CacheStore>,
}

impl Renderer {
    pub fn new(config: RenderConfig, store: Arc<dyn CacheStore>) -> Result<Self, ConfigError> {
        let global_key = config.global_key_exprs()?;
        Ok(Renderer {
            config,
            global_key,
            store,
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn render(
        &self,
        template: &CompiledTemplate,
        data: RuntimeValue,
    ) -> Result<RenderOutput, DiagnosticError> {
        RenderPass::new(template, self.store.as_ref(), &self.config, &self.global_key, data).run()
    }
}

/// One render of one template. Owns the data context and the expression
/// memo, both discarded when the pass ends.
pub struct RenderPass<'a> {
    template: &'a CompiledTemplate,
    store: &'a dyn CacheStore,
    config: &'a RenderConfig,
    global_key_exprs: &'a [Expr],
    /// Evaluated on first use, then reused by every region of the pass.
    global_key: Option<String>,
    nodes: NodeRenderer,
    stats: RenderStats,
    warnings: Vec<DiagnosticError>,
}

impl<'a> RenderPass<'a> {
    pub fn new(
        template: &'a CompiledTemplate,
        store: &'a dyn CacheStore,
        config: &'a RenderConfig,
        global_key_exprs: &'a [Expr],
        data: RuntimeValue,
    ) -> Self {
        RenderPass {
            template,
            store,
            config,
            global_key_exprs,
            global_key: None,
            nodes: NodeRenderer::new(data, template.source_id),
            stats: RenderStats::default(),
            warnings: Vec::new(),
        }
    }

    /// Render every region in sequence order.
    pub fn run(mut self) -> Result<RenderOutput, DiagnosticError> {
        let mut text = String::new();
        for region in &self.template.regions {
            match region {
                FlattenedRegion::Passthrough(region) => {
                    self.nodes.render_nodes(&region.body, &mut text)?;
                }
                FlattenedRegion::Cached(region) => self.render_cached(region, &mut text)?,
            }
        }

        let memo = &self.nodes.memo;
        self.stats.evaluated = memo.evaluated().clone();
        self.stats.evaluations = memo.evaluated().values().sum();
        self.stats.memo_hits = memo.hits();

        Ok(RenderOutput {
            text,
            warnings: self.warnings,
            stats: self.stats,
        })
    }

    fn render_cached(&mut self, region: &CachedRegion, out: &mut String) -> Result<(), DiagnosticError> {
        if !self.config.enabled {
            return self.nodes.render_nodes(&region.body, out);
        }

        let active = match &region.condition {
            Some(condition) => self.nodes.evaluate(condition, Lookup::Strict)?.is_truthy() != region.negated,
            None => true,
        };
        if !active {
            self.stats.skipped_regions += 1;
            debug!(
                block = %region.block_hash,
                segment = region.segment,
                "cache condition false, rendering directly"
            );
            return self.nodes.render_nodes(&region.body, out);
        }

        let mut key_values = Vec::with_capacity(region.key_exprs.len());
        for expr in &region.key_exprs {
            key_values.push(self.nodes.evaluate(expr, Lookup::Strict)?.to_string());
        }
        let key = compose_key(&CacheKeyMaterial {
            global_key: self.global_key()?,
            block_hash: region.block_hash.clone(),
            segment: region.segment,
            key_values,
        });

        self.stats.store_gets += 1;
        match self.store.get(&key) {
            Ok(Some(content)) => {
                self.stats.cache_hits += 1;
                debug!(key = %key, "cache hit");
                out.push_str(&content);
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => self.store_failure(err, region)?,
        }

        self.stats.cache_misses += 1;
        debug!(key = %key, "cache miss");
        let mut rendered = String::new();
        self.nodes.render_nodes(&region.body, &mut rendered)?;

        self.stats.store_sets += 1;
        if let Err(err) = self.store.set(&key, &rendered, self.config.ttl()) {
            self.store_failure(err, region)?;
        }
        out.push_str(&rendered);
        Ok(())
    }

    fn global_key(&mut self) -> Result<String, DiagnosticError> {
        if let Some(key) = &self.global_key {
            return Ok(key.clone());
        }
        let mut values = Vec::with_capacity(self.global_key_exprs.len());
        for expr in self.global_key_exprs {
            values.push(self.nodes.evaluate(expr, Lookup::Lenient)?.to_string());
        }
        let key = values.join(GLOBAL_KEY_SEPARATOR);
        self.global_key = Some(key.clone());
        Ok(key)
    }

    fn store_failure(&mut self, err: StoreError, region: &CachedRegion) -> Result<(), DiagnosticError> {
        let source_id = self.template.source_id;
        let span = Some(region.span.clone());
        match self.config.store_failure {
            StoreFailurePolicy::Fail => Err(DiagnosticError::at(RuntimeError::Store(err), span, source_id)),
            StoreFailurePolicy::Degrade => {
                warn!(error = %err, block = %region.block_hash, "cache store failure, rendering without cache");
                self.stats.store_failures += 1;
                self.warnings
                    .push(DiagnosticError::warning(RuntimeError::Store(err), span, source_id));
                Ok(())
            }
        }
    }
}

/// Render an unflattened node tree directly, treating `cached` and
/// `uncached` wrappers as transparent.
pub fn render_tree(
    nodes: &[TemplateNode],
    data: RuntimeValue,
    source_id: usize,
) -> Result<String, DiagnosticError> {
    let mut renderer = NodeRenderer::new(data, source_id);
    let mut out = String::new();
    renderer.render_nodes(nodes, &mut out)?;
    Ok(out)
}

/// Renders template nodes against the data context.
struct NodeRenderer {
    env: Environment,
    memo: ExpressionMemo,
    source_id: usize,
}

impl NodeRenderer {
    fn new(data: RuntimeValue, source_id: usize) -> Self {
        NodeRenderer {
            env: Environment::new(data),
            memo: ExpressionMemo::new(source_id),
            source_id,
        }
    }

    fn evaluate(&mut self, expr: &Expr, lookup: Lookup) -> Result<RuntimeValue, DiagnosticError> {
        self.memo.evaluate(expr, &self.env, lookup)
    }

    fn render_nodes(&mut self, nodes: &[TemplateNode], out: &mut String) -> Result<(), DiagnosticError> {
        for node in nodes {
            self.render_node(node, out)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &TemplateNode, out: &mut String) -> Result<(), DiagnosticError> {
        match node {
            TemplateNode::Text(text) => out.push_str(text),
            TemplateNode::Expression(expr) => {
                let value = self.evaluate(expr, Lookup::Lenient)?;
                out.push_str(&value.to_string());
            }
            TemplateNode::Loop { path, body, span } => {
                let items = match self.evaluate(path, Lookup::Lenient)? {
                    RuntimeValue::List(items) => items,
                    RuntimeValue::Null | RuntimeValue::Boolean(false) => Vec::new(),
                    record @ RuntimeValue::Record(_) => vec![record],
                    other => {
                        return Err(DiagnosticError::at(
                            RuntimeError::NotIterable(other.type_name().to_string()),
                            Some(span.clone()),
                            self.source_id,
                        ));
                    }
                };
                let total = items.len();
                for (index, item) in items.into_iter().enumerate() {
                    self.env.push_loop_item(item, index, total);
                    let result = self.render_nodes(body, out);
                    self.env.pop_scope();
                    result?;
                }
            }
            TemplateNode::Conditional {
                condition,
                then_body,
                else_body,
                ..
            } => {
                if self.evaluate(condition, Lookup::Lenient)?.is_truthy() {
                    self.render_nodes(then_body, out)?;
                } else {
                    self.render_nodes(else_body, out)?;
                }
            }
            TemplateNode::CacheBlock(block) => self.render_nodes(&block.body, out)?,
            TemplateNode::UncachedBlock { body, .. } => self.render_nodes(body, out)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn data() -> RuntimeValue {
        RuntimeValue::record([
            ("Title", RuntimeValue::from("Home")),
            (
                "Items",
                RuntimeValue::List(vec![
                    RuntimeValue::record([("Name", RuntimeValue::from("a"))]),
                    RuntimeValue::record([("Name", RuntimeValue::from("b"))]),
                ]),
            ),
        ])
    }

    fn tree(source: &str) -> String {
        let template = sstemplate::compile(source, 0).unwrap();
        render_tree(&template.nodes, data(), 0).unwrap()
    }

    #[test]
    fn loops_expose_position_fields() {
        assert_eq!(
            tree("<% loop $Items %>$Pos:$Name<% if not $Last %>,<% end_if %><% end_loop %>"),
            "1:a,2:b"
        );
    }

    #[test]
    fn missing_loop_source_renders_nothing() {
        assert_eq!(tree("[<% loop $Nothing %>x<% end_loop %>]"), "[]");
    }

    #[test]
    fn looping_over_text_is_an_error() {
        let template = sstemplate::compile("<% loop $Title %>x<% end_loop %>", 0).unwrap();
        let err = render_tree(&template.nodes, data(), 0).unwrap_err();
        assert!(matches!(err.error, RuntimeError::NotIterable(_)));
        assert_eq!(err.span, Some(0..32));
    }

    #[test]
    fn cache_wrappers_are_transparent_in_tree_render() {
        assert_eq!(tree("<% cached %>a<% uncached %>$Title<% end_uncached %>c<% end_cached %>"), "aHomec");
    }

    #[test]
    fn disabled_caching_never_touches_the_store() {
        let template = sstemplate::compile("<% cached %>$Title<% end_cached %>", 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = RenderConfig {
            enabled: false,
            ..RenderConfig::default()
        };
        let renderer = Renderer::new(config, store.clone()).unwrap();
        let output = renderer.render(&template, data()).unwrap();
        assert_eq!(output.text, "Home");
        assert_eq!(output.stats.store_gets, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn global_key_is_evaluated_once_per_pass() {
        let template = sstemplate::compile("<% cached 1 %>a<% end_cached %><% cached 2 %>b<% end_cached %>", 0).unwrap();
        let config = RenderConfig {
            global_key: "$Title".into(),
            ..RenderConfig::default()
        };
        let renderer = Renderer::new(config, Arc::new(MemoryStore::new())).unwrap();
        let output = renderer.render(&template, data()).unwrap();
        assert_eq!(output.stats.evaluated.get("$Title"), Some(&1));
        assert_eq!(output.stats.cache_misses, 2);
    }
}
