//! Multi-source context assembly with a token budget.

pub mod assembler;
pub mod token;

pub use assembler::{
    AssemblySettings, ContextAssembler, ContextBundle, ContextItem, DropInfo, LayerStats,
    PriorExchange, ProfileSnippet, RecordLine, Section, SectionKind,
};
