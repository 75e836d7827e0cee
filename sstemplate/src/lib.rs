pub mod expr;
pub mod fingerprint;
pub mod flatten;
pub mod node;
pub mod parser;

use crate::flatten::FlattenedRegion;
use crate::node::TemplateNode;
use crate::parser::ParseError;

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    /// Top-level nodes.
    pub nodes: Vec<TemplateNode>,
    /// The source file ID (for error reporting with codespan-reporting).
    pub source_id: usize,
}

impl Template {
    /// Flatten the parsed tree into cache regions.
    pub fn compile(self) -> Result<CompiledTemplate, Vec<ParseError>> {
        let regions = flatten::flatten(&self.nodes, self.source_id)?;
        Ok(CompiledTemplate {
            regions,
            nodes: self.nodes,
            source_id: self.source_id,
        })
    }
}

/// A template ready to render: the flat region sequence plus the tree it
/// was produced from. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub regions: Vec<FlattenedRegion>,
    pub nodes: Vec<TemplateNode>,
    pub source_id: usize,
}

/// Parse and flatten `source` in one step.
pub fn compile(source: &str, file_id: usize) -> Result<CompiledTemplate, Vec<ParseError>> {
    parser::Parser::new(source.to_string(), file_id).parse()?.compile()
}
