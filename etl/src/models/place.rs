use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A restaurant whose coordinates have to be looked up by name and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceQuery {
    pub id: i64,
    pub name: String,
    pub country: String,
    pub city: String,
}

impl PlaceQuery {
    pub fn new(id: i64, name: &str, country: &str, city: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            country: country.to_string(),
            city: city.to_string(),
        }
    }

    /// Free-text query sent to the geocoder.
    pub fn text(&self) -> String {
        format!("{}, {}, {}", self.name, self.country, self.city)
    }

    pub fn key(&self) -> PlaceKey {
        PlaceKey {
            name: self.name.clone(),
            country: self.country.clone(),
            city: self.city.clone(),
        }
    }
}

/// Identity of a place for lookup caching. Record ids are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceKey {
    pub name: String,
    pub country: String,
    pub city: String,
}

impl fmt::Display for PlaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.name, self.country, self.city)
    }
}
