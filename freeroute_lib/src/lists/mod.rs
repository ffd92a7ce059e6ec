pub mod persistent;
pub mod probe;
pub mod registry;
pub mod suffix;

pub use suffix::SuffixMatcher;
