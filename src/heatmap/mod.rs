pub mod normalize;
pub mod reconcile;
pub mod service;
pub mod top_n;

pub use normalize::normalize_results;
pub use reconcile::{IndexState, Reconciler};
pub use service::HeatmapService;
pub use top_n::{select_top_taxa, TopTaxa};
