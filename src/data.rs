use crate::config::{AppConfig, GeometrySource};
use crate::types::{AttributeRecord, BackgroundLayer, GeoFeature};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use geo::MultiPolygon;
use geojson::{FeatureCollection, GeoJson};
use shapefile::Reader;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use topojson::TopoJson;
use tracing::{info, warn};

/// Everything read from disk before the join runs.
#[derive(Debug)]
pub struct LoadedInputs {
    pub records: Vec<AttributeRecord>,
    pub features: Vec<GeoFeature>,
    pub background: Vec<BackgroundLayer>,
}

/// Loads the attribute table, the enumeration units and any background layers
/// concurrently. All of them must load; the first failure aborts the whole load.
pub async fn load_inputs(config: &AppConfig) -> Result<LoadedInputs> {
    info!("Loading data...");

    let csv_path = config.input.attributes_csv.clone();
    let csv_join = config.input.join_column_csv.clone();
    let units = config.input.enumeration_units.clone();
    let geo_join = config.input.join_column_geo.clone();
    let background = config.input.background.clone();
    let background_join = geo_join.clone();

    let (records, features, background) = tokio::try_join!(
        blocking(move || load_attribute_records(&csv_path, &csv_join)),
        blocking(move || load_features(&units, &geo_join)),
        blocking(move || load_background_layers(&background, &background_join)),
    )?;

    info!(
        records = records.len(),
        features = features.len(),
        background_layers = background.len(),
        "Inputs loaded"
    );

    Ok(LoadedInputs {
        records,
        features,
        background,
    })
}

async fn blocking<T, F>(load: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(load)
        .await
        .context("Loader task did not complete")?
}

pub fn load_attribute_records(path: &Path, join_column: &str) -> Result<Vec<AttributeRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let mut rdr = ReaderBuilder::new().from_reader(file);
    let headers = rdr
        .headers()
        .with_context(|| format!("Failed to read CSV header: {:?}", path))?
        .clone();

    let join_col_idx = headers
        .iter()
        .position(|h| h == join_column)
        .ok_or_else(|| anyhow!("Join column '{}' not found in CSV", join_column))?;

    let mut records = Vec::new();

    for result in rdr.records() {
        let row = result.with_context(|| format!("Malformed CSV row in {:?}", path))?;
        let id = row.get(join_col_idx).unwrap_or("").to_string();

        if id.is_empty() {
            continue;
        }

        let fields: HashMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();

        records.push(AttributeRecord { id, fields });
    }

    info!("Loaded CSV data for {} areas", records.len());
    Ok(records)
}

pub fn load_features(source: &GeometrySource, id_property: &str) -> Result<Vec<GeoFeature>> {
    let extension = source
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Input geometry file has no extension: {:?}", source.path))?;

    let features = match extension.as_str() {
        "shp" => load_shapefile(&source.path, id_property)?,
        "json" | "geojson" => {
            let collection = read_geojson(&source.path)?;
            features_from_collection(collection, id_property)?
        }
        "topojson" => {
            let collection = read_topojson(&source.path, source.object.as_deref())?;
            features_from_collection(collection, id_property)?
        }
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    info!("Loaded {} features from {:?}", features.len(), source.path);
    Ok(features)
}

fn load_background_layers(
    sources: &[GeometrySource],
    id_property: &str,
) -> Result<Vec<BackgroundLayer>> {
    sources
        .iter()
        .map(|source| {
            Ok(BackgroundLayer {
                name: source.layer_name(),
                features: load_features(source, id_property)?,
            })
        })
        .collect()
}

fn read_geojson(path: &Path) -> Result<FeatureCollection> {
    let file =
        File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let reader = BufReader::new(file);

    // Parse the whole document; tract-level files fit comfortably in memory.
    let geojson = GeoJson::from_reader(reader)
        .with_context(|| format!("Failed to parse GeoJSON: {:?}", path))?;

    match geojson {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        _ => Err(anyhow!("GeoJSON must be a FeatureCollection: {:?}", path)),
    }
}

fn read_topojson(path: &Path, object: Option<&str>) -> Result<FeatureCollection> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to open TopoJSON file: {:?}", path))?;
    let topo: TopoJson = content
        .parse()
        .map_err(|e| anyhow!("Failed to parse TopoJSON {:?}: {:?}", path, e))?;

    let topology = match topo {
        TopoJson::Topology(t) => t,
        _ => return Err(anyhow!("TopoJSON must be a Topology: {:?}", path)),
    };

    let object_name = match object {
        Some(name) => name.to_string(),
        None => match topology.objects.as_slice() {
            [only] => only.name.clone(),
            objects => {
                let names: Vec<&str> = objects.iter().map(|o| o.name.as_str()).collect();
                return Err(anyhow!(
                    "TopoJSON {:?} holds objects {:?}; set `object` to pick one",
                    path,
                    names
                ));
            }
        },
    };

    if !topology.objects.iter().any(|o| o.name == object_name) {
        return Err(anyhow!(
            "Object '{}' not found in TopoJSON {:?}",
            object_name,
            path
        ));
    }

    let converted = topojson::to_geojson(&topology, &object_name)
        .map_err(|e| anyhow!("Failed to convert TopoJSON object '{}': {:?}", object_name, e))?;

    // topojson builds against its own geojson release; cross over through JSON
    let value = serde_json::to_value(&converted)
        .with_context(|| format!("Failed to serialize TopoJSON object '{}'", object_name))?;
    serde_json::from_value(value)
        .with_context(|| format!("Failed to read TopoJSON object '{}' as GeoJSON", object_name))
}

fn features_from_collection(
    collection: FeatureCollection,
    id_property: &str,
) -> Result<Vec<GeoFeature>> {
    let mut features = Vec::new();
    let mut skipped = 0usize;

    for feature in collection.features {
        // 1. Identifier from the join property, else the feature id
        let from_property = feature
            .properties
            .as_ref()
            .and_then(|props| props.get(id_property))
            .and_then(|value| match value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let id = from_property.or_else(|| match &feature.id {
            Some(geojson::feature::Id::String(s)) => Some(s.clone()),
            Some(geojson::feature::Id::Number(n)) => Some(n.to_string()),
            None => None,
        });

        // 2. Polygonal geometry only
        let geometry = match feature.geometry {
            Some(geom) => {
                let valid_geo: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;

                match valid_geo {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => {
                        skipped += 1;
                        continue;
                    }
                }
            }
            None => {
                skipped += 1;
                continue;
            }
        };

        let mut unit = GeoFeature::new(id, geometry);
        unit.properties = feature.properties.unwrap_or_default();
        features.push(unit);
    }

    if skipped > 0 {
        warn!("Skipped {} features without polygon geometry", skipped);
    }

    Ok(features)
}

fn load_shapefile(path: &Path, id_property: &str) -> Result<Vec<GeoFeature>> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut features = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let id = match record.get(id_property) {
            Some(value) => field_to_id(value),
            None => {
                return Err(anyhow!(
                    "Join column '{}' not found in Shapefile",
                    id_property
                ))
            }
        };

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
            shapefile::Shape::PolygonM(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
            _ => continue, // Skip non-polygon shapes
        };

        let mut unit = GeoFeature::new(id.clone(), geometry);
        for (name, value) in record.into_iter() {
            if let Some(json) = field_to_json(&value) {
                unit.properties.insert(name, json);
            }
        }
        if let Some(id) = id {
            unit.properties
                .insert(id_property.to_string(), serde_json::Value::String(id));
        }
        features.push(unit);
    }

    Ok(features)
}

fn field_to_json(value: &shapefile::dbase::FieldValue) -> Option<serde_json::Value> {
    use shapefile::dbase::FieldValue;

    match value {
        FieldValue::Character(Some(s)) => Some(serde_json::Value::String(s.trim().to_string())),
        FieldValue::Numeric(Some(n)) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
        _ => None,
    }
}

fn field_to_id(value: &shapefile::dbase::FieldValue) -> Option<String> {
    use shapefile::dbase::FieldValue;

    match value {
        FieldValue::Character(Some(s)) => Some(s.trim().to_string()),
        // Integral codes stored as numerics should compare like CSV identifiers
        FieldValue::Numeric(Some(n)) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        FieldValue::Numeric(Some(n)) => Some(n.to_string()),
        _ => None,
    }
}
