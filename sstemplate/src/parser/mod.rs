pub mod error;
pub mod expression;
mod structural;

pub use error::{ErrorKind, ParseError};

use crate::Template;

/// Parser entry point.
pub struct Parser {
    source: String,
    file_id: usize,
}

impl Parser {
    pub fn new(source: String, file_id: usize) -> Self {
        Parser { source, file_id }
    }

    /// Parse the template source into a node tree.
    pub fn parse(&self) -> Result<Template, Vec<ParseError>> {
        let nodes = structural::parse_nodes(&self.source, self.file_id)?;
        Ok(Template {
            nodes,
            source_id: self.file_id,
        })
    }
}
