pub mod classifier;
pub mod error;
pub mod pacer;
pub mod places;
pub mod rank_index;
pub mod registry;
pub mod serp;
pub mod statbase;

pub use classifier::{ClassifierClient, LabeledItem};
pub use error::{ProviderError, Result};
pub use pacer::{Pacer, PacerConfig};
pub use places::{PlacesClient, PlaceHit};
pub use rank_index::{DomainFootprint, RankIndexClient};
pub use registry::RegistryClient;
pub use serp::{SerpClient, SerpResult};
pub use statbase::StatBaseClient;
