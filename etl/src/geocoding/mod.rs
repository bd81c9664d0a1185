mod cache;
mod opencage;
mod resolver;

pub use cache::GeocodeCache;
pub use opencage::OpenCageGeocoder;
pub use resolver::{CoordinateResolver, ResolutionReport, ResolverOptions};

use crate::models::{Coordinates, PlaceQuery};
use async_trait::async_trait;
use common::Result;

/// External lookup turning a place description into coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync + 'static {
    /// Best match for the place, or `Ok(None)` when the service has no match.
    async fn lookup(&self, query: &PlaceQuery) -> Result<Option<Coordinates>>;
}
