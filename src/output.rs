use crate::session::Session;
use crate::types::{BackgroundLayer, GeoFeature};
use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, Geometry};
use serde_json::{Map, Value as JsonValue};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

type JsonObject = Map<String, JsonValue>;

pub const VALUE_PROPERTY: &str = "choropleth_value";
pub const CLASS_PROPERTY: &str = "choropleth_class";
pub const COLOR_PROPERTY: &str = "choropleth_color";
pub const ATTRIBUTE_PROPERTY: &str = "choropleth_attribute";

/// Enumeration units as GeoJSON, colored by the session's active attribute.
pub fn feature_collection(session: &Session) -> FeatureCollection {
    let attribute = &session.active_attribute().name;

    let features = session
        .features()
        .iter()
        .enumerate()
        .map(|(index, unit)| {
            let mut properties = unit.properties.clone();
            for (name, value) in &unit.attributes {
                properties.insert(name.clone(), number(*value));
            }

            let value = session.value_of(index);
            properties.insert(
                ATTRIBUTE_PROPERTY.to_string(),
                JsonValue::String(attribute.clone()),
            );
            properties.insert(
                VALUE_PROPERTY.to_string(),
                value.map_or(JsonValue::Null, number),
            );
            properties.insert(
                CLASS_PROPERTY.to_string(),
                session
                    .class_of(index)
                    .index()
                    .map_or(JsonValue::Null, |c| JsonValue::from(c)),
            );
            properties.insert(
                COLOR_PROPERTY.to_string(),
                JsonValue::String(session.color_of(index).to_string()),
            );

            to_feature(unit, properties)
        })
        .collect();

    collection(features)
}

/// Background layers flattened into one collection, each feature tagged with its layer.
pub fn background_collection(layers: &[BackgroundLayer]) -> FeatureCollection {
    let features = layers
        .iter()
        .flat_map(|layer| {
            layer.features.iter().map(|unit| {
                let mut properties = unit.properties.clone();
                properties.insert("layer".to_string(), JsonValue::String(layer.name.clone()));
                to_feature(unit, properties)
            })
        })
        .collect();

    collection(features)
}

pub fn write_geojson(collection: &FeatureCollection, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }

    let file =
        File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), collection)
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))?;

    info!("Wrote {} features to {:?}", collection.features.len(), path);
    Ok(())
}

// JSON has no NaN; non-finite values are written as null.
fn number(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value).map_or(JsonValue::Null, JsonValue::Number)
}

fn to_feature(unit: &GeoFeature, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::from(&unit.geometry))),
        id: unit.id.clone().map(geojson::feature::Id::String),
        properties: Some(properties),
        foreign_members: None,
    }
}

fn collection(features: Vec<Feature>) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Palette;
    use crate::config::{AttributeConfig, NoDataPolicy};
    use geo::{polygon, MultiPolygon};
    use geojson::GeoJson;
    use tempfile::TempDir;

    fn unit(id: &str, poverty: Option<f64>) -> GeoFeature {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let mut f = GeoFeature::new(Some(id.to_string()), MultiPolygon::new(vec![square]));
        f.properties
            .insert("NAME".to_string(), JsonValue::String(format!("Tract {}", id)));
        if let Some(v) = poverty {
            f.attributes.insert("poverty_rate".to_string(), v);
        }
        f
    }

    fn session() -> Session {
        let features = vec![
            unit("A", Some(10.0)),
            unit("B", Some(50.0)),
            unit("C", Some(f64::NAN)),
            unit("D", None),
        ];
        Session::new(
            features,
            vec![AttributeConfig {
                name: "poverty_rate".to_string(),
                label: None,
            }],
            Palette {
                colors: vec!["low".to_string(), "high".to_string()],
                no_data: "grey".to_string(),
            },
            NoDataPolicy::Strict,
            Some("NAME".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_feature_properties() {
        let fc = feature_collection(&session());
        assert_eq!(fc.features.len(), 4);

        let a = fc.features[0].properties.as_ref().unwrap();
        assert_eq!(a["NAME"], JsonValue::String("Tract A".to_string()));
        assert_eq!(a[VALUE_PROPERTY], JsonValue::from(10.0));
        assert_eq!(a[CLASS_PROPERTY], JsonValue::from(0));
        assert_eq!(a[COLOR_PROPERTY], JsonValue::String("low".to_string()));

        let b = fc.features[1].properties.as_ref().unwrap();
        assert_eq!(b[COLOR_PROPERTY], JsonValue::String("high".to_string()));

        let c = fc.features[2].properties.as_ref().unwrap();
        assert_eq!(c["poverty_rate"], JsonValue::Null);
        assert_eq!(c[CLASS_PROPERTY], JsonValue::Null);
        assert_eq!(c[COLOR_PROPERTY], JsonValue::String("grey".to_string()));

        let d = fc.features[3].properties.as_ref().unwrap();
        assert!(!d.contains_key("poverty_rate"));
        assert_eq!(d[VALUE_PROPERTY], JsonValue::Null);
    }

    #[test]
    fn test_write_geojson_roundtrips_through_parser() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("map.geojson");
        write_geojson(&feature_collection(&session()), &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        match content.parse::<GeoJson>().unwrap() {
            GeoJson::FeatureCollection(fc) => assert_eq!(fc.features.len(), 4),
            other => panic!("unexpected document: {:?}", other),
        }
    }

    #[test]
    fn test_background_layers_are_tagged() {
        let layers = vec![BackgroundLayer {
            name: "counties".to_string(),
            features: vec![unit("X", None)],
        }];
        let fc = background_collection(&layers);
        let props = fc.features[0].properties.as_ref().unwrap();
        assert_eq!(props["layer"], JsonValue::String("counties".to_string()));
    }
}
