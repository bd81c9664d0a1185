pub mod join;
pub mod restaurants;
pub mod weather;
pub mod writer;

pub use join::{BroadcastTable, JoinMetrics, JoinReport, broadcast_join};
pub use restaurants::{EnrichedRestaurants, EnrichmentReport, RestaurantEnricher, read_restaurants};
pub use weather::{key_weather, read_weather};
pub use writer::{PartitionedWriter, SuccessMarker, WriteReport};
