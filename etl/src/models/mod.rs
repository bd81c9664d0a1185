mod place;

pub use place::{Coordinates, PlaceKey, PlaceQuery};

/// Column names shared by the restaurant and weather datasets.
pub mod columns {
    pub const ID: &str = "id";
    pub const FRANCHISE_NAME: &str = "franchise_name";
    pub const COUNTRY: &str = "country";
    pub const CITY: &str = "city";
    pub const LAT: &str = "lat";
    pub const LNG: &str = "lng";
    pub const YEAR: &str = "year";
    pub const MONTH: &str = "month";

    pub const RESOLVED_ID: &str = "resolved_id";
    pub const RESOLVED_LAT: &str = "resolved_lat";
    pub const RESOLVED_LNG: &str = "resolved_lng";
}
