use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub attributes_csv: PathBuf,
    pub join_column_csv: String,
    pub join_column_geo: String,
    pub enumeration_units: GeometrySource,
    #[serde(default)]
    pub background: Vec<GeometrySource>,
    /// Feature property shown as the unit name in tooltips
    pub name_property: Option<String>,
}

/// A spatial file. `object` names the TopoJSON object to extract and is
/// ignored for GeoJSON and Shapefile inputs.
#[derive(Debug, Deserialize, Clone)]
pub struct GeometrySource {
    pub path: PathBuf,
    pub object: Option<String>,
    pub name: Option<String>,
}

impl GeometrySource {
    pub fn layer_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.object.clone())
            .or_else(|| {
                self.path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "layer".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassificationConfig {
    pub attributes: Vec<AttributeConfig>,
    /// Attribute selected at startup; the first listed one when absent
    pub default_attribute: Option<String>,
    #[serde(default = "default_palette")]
    pub palette: Vec<String>,
    #[serde(default = "default_no_data_color")]
    pub no_data_color: String,
    #[serde(default)]
    pub no_data_policy: NoDataPolicy,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AttributeConfig {
    pub name: String, // CSV column
    pub label: Option<String>,
}

impl AttributeConfig {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Decides which joined values count as "no data".
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoDataPolicy {
    /// Only absent or non-finite values are missing.
    #[default]
    Strict,
    /// Exactly zero is also missing, as in a JavaScript truthiness check.
    LegacyZero,
}

impl NoDataPolicy {
    pub fn has_data(self, value: Option<f64>) -> bool {
        match value {
            Some(v) if v.is_finite() => !(self == NoDataPolicy::LegacyZero && v == 0.0),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_geojson")]
    pub geojson: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            geojson: default_output_geojson(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            static_dir: None,
        }
    }
}

// Five-class sequential purple-red ramp, low to high
fn default_palette() -> Vec<String> {
    ["#f1eef6", "#d7b5d8", "#df65b0", "#dd1c77", "#980043"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_no_data_color() -> String {
    "#cccccc".to_string()
}

fn default_output_geojson() -> PathBuf {
    PathBuf::from("output/choropleth.geojson")
}

fn default_port() -> u16 {
    3000
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let classification = &self.classification;
        if classification.attributes.is_empty() {
            return Err(anyhow!("At least one attribute must be configured"));
        }
        if classification.palette.is_empty() {
            return Err(anyhow!("Color palette must contain at least one color"));
        }

        let mut seen = HashSet::new();
        for attribute in &classification.attributes {
            if !seen.insert(attribute.name.as_str()) {
                return Err(anyhow!("Attribute '{}' is listed twice", attribute.name));
            }
        }

        if let Some(default) = &classification.default_attribute {
            if !seen.contains(default.as_str()) {
                return Err(anyhow!(
                    "Default attribute '{}' is not in the attribute list",
                    default
                ));
            }
        }

        Ok(())
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.classification
            .attributes
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn default_attribute(&self) -> &str {
        self.classification
            .default_attribute
            .as_deref()
            .unwrap_or(&self.classification.attributes[0].name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [input]
        attributes_csv = "data/tracts.csv"
        join_column_csv = "GEO_ID"
        join_column_geo = "GEO_ID"

        [input.enumeration_units]
        path = "data/tracts.topojson"
        object = "milwaukeeTracts"

        [classification]
        attributes = [
            { name = "poverty_rate", label = "Poverty rate (%)" },
            { name = "median_income" },
        ]
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.classification.palette.len(), 5);
        assert_eq!(config.classification.no_data_color, "#cccccc");
        assert_eq!(config.classification.no_data_policy, NoDataPolicy::Strict);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.default_attribute(), "poverty_rate");
        assert_eq!(config.classification.attributes[1].label(), "median_income");
        assert_eq!(config.input.enumeration_units.layer_name(), "milwaukeeTracts");
    }

    #[test]
    fn test_unknown_default_attribute_rejected() {
        let toml = MINIMAL.replace(
            "[classification]",
            "[classification]\ndefault_attribute = \"rent\"",
        );
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("rent"));
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let toml = MINIMAL.replace("{ name = \"median_income\" }", "{ name = \"poverty_rate\" }");
        assert!(AppConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_legacy_zero_policy() {
        let toml = MINIMAL.replace(
            "[classification]",
            "[classification]\nno_data_policy = \"legacy_zero\"",
        );
        let config = AppConfig::from_toml_str(&toml).unwrap();
        let policy = config.classification.no_data_policy;
        assert_eq!(policy, NoDataPolicy::LegacyZero);
        assert!(!policy.has_data(Some(0.0)));
        assert!(policy.has_data(Some(0.5)));
        assert!(NoDataPolicy::Strict.has_data(Some(0.0)));
        assert!(!NoDataPolicy::Strict.has_data(Some(f64::NAN)));
        assert!(!NoDataPolicy::Strict.has_data(None));
    }
}
