use geo::MultiPolygon;
use std::collections::{BTreeMap, HashMap};

/// One row of the attribute table, keyed by its geographic identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
    pub id: String,
    // Raw CSV cells by column name, parsed only when joined
    pub fields: HashMap<String, String>,
}

/// An enumeration unit (census tract, county) with its joined attribute values.
#[derive(Debug, Clone)]
pub struct GeoFeature {
    pub id: Option<String>,
    pub geometry: MultiPolygon<f64>,
    // Properties as read from the spatial file, passed through untouched
    pub properties: serde_json::Map<String, serde_json::Value>,
    // Joined numeric fields. NaN marks a matched but non-numeric cell.
    pub attributes: BTreeMap<String, f64>,
}

impl GeoFeature {
    pub fn new(id: Option<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            id,
            geometry,
            properties: serde_json::Map::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Display name for tooltips: the named property if present, else the identifier.
    pub fn display_name(&self, name_property: Option<&str>) -> String {
        let named = name_property
            .and_then(|key| self.properties.get(key))
            .and_then(|value| match value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        named
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Geometry layer drawn underneath the choropleth; never joined or classified.
#[derive(Debug, Clone)]
pub struct BackgroundLayer {
    pub name: String,
    pub features: Vec<GeoFeature>,
}
