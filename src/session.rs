use crate::classify::{Class, LegendEntry, Palette, QuantileScale, ScaleError};
use crate::config::{AppConfig, AttributeConfig, NoDataPolicy};
use crate::types::GeoFeature;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("no attributes configured")]
    NoAttributes,

    #[error("scale error: {0}")]
    Scale(#[from] ScaleError),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeatureColor {
    pub index: usize,
    pub id: Option<String>,
    pub color: String,
}

/// Emitted after every successful attribute selection.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionChange {
    pub previous: String,
    pub current: String,
    pub colors: Vec<FeatureColor>,
}

pub trait SelectionListener: Send {
    fn on_selection_changed(&mut self, change: &SelectionChange);
}

impl<F> SelectionListener for F
where
    F: FnMut(&SelectionChange) + Send,
{
    fn on_selection_changed(&mut self, change: &SelectionChange) {
        self(change)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartBar {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub value: f64,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Tooltip {
    pub id: Option<String>,
    pub name: String,
    pub attribute: String,
    pub label: String,
    pub value: Option<f64>,
    pub text: String,
}

/// Joined features plus the attribute currently driving the map colors.
///
/// The scale is rebuilt from scratch on every selection and depends only on
/// the newly selected attribute's values.
pub struct Session {
    features: Vec<GeoFeature>,
    attributes: Vec<AttributeConfig>,
    palette: Palette,
    policy: NoDataPolicy,
    name_property: Option<String>,
    active: usize,
    scale: QuantileScale,
    listeners: Vec<Box<dyn SelectionListener>>,
}

impl Session {
    pub fn new(
        features: Vec<GeoFeature>,
        attributes: Vec<AttributeConfig>,
        palette: Palette,
        policy: NoDataPolicy,
        name_property: Option<String>,
    ) -> Result<Self, SessionError> {
        if attributes.is_empty() {
            return Err(SessionError::NoAttributes);
        }

        let mut session = Self {
            features,
            attributes,
            scale: QuantileScale::new(std::iter::empty(), palette.clone())?,
            palette,
            policy,
            name_property,
            active: 0,
            listeners: Vec::new(),
        };
        session.scale = session.build_scale(0)?;
        Ok(session)
    }

    pub fn from_config(features: Vec<GeoFeature>, config: &AppConfig) -> Result<Self, SessionError> {
        let classification = &config.classification;
        let palette = Palette {
            colors: classification.palette.clone(),
            no_data: classification.no_data_color.clone(),
        };
        let mut session = Self::new(
            features,
            classification.attributes.clone(),
            palette,
            classification.no_data_policy,
            config.input.name_property.clone(),
        )?;
        session.select_attribute(config.default_attribute())?;
        Ok(session)
    }

    pub fn subscribe<L>(&mut self, listener: L)
    where
        L: SelectionListener + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Makes `name` the active attribute, recomputes the scale and notifies listeners.
    pub fn select_attribute(&mut self, name: &str) -> Result<&QuantileScale, SessionError> {
        let index = self
            .attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| SessionError::UnknownAttribute(name.to_string()))?;

        let scale = self.build_scale(index)?;
        let previous = self.attributes[self.active].name.clone();
        self.active = index;
        self.scale = scale;

        info!(
            attribute = name,
            thresholds = ?self.scale.thresholds(),
            "Selected attribute"
        );

        if !self.listeners.is_empty() {
            let change = SelectionChange {
                previous,
                current: name.to_string(),
                colors: self.feature_colors(),
            };
            for listener in self.listeners.iter_mut() {
                listener.on_selection_changed(&change);
            }
        }

        Ok(&self.scale)
    }

    fn build_scale(&self, attribute: usize) -> Result<QuantileScale, ScaleError> {
        let name = &self.attributes[attribute].name;
        let values = self
            .features
            .iter()
            .filter_map(|f| self.valid_value(f, name));
        QuantileScale::new(values, self.palette.clone())
    }

    fn valid_value(&self, feature: &GeoFeature, attribute: &str) -> Option<f64> {
        let value = feature.attributes.get(attribute).copied();
        if self.policy.has_data(value) {
            value
        } else {
            None
        }
    }

    pub fn active_attribute(&self) -> &AttributeConfig {
        &self.attributes[self.active]
    }

    pub fn attributes(&self) -> &[AttributeConfig] {
        &self.attributes
    }

    pub fn scale(&self) -> &QuantileScale {
        &self.scale
    }

    pub fn features(&self) -> &[GeoFeature] {
        &self.features
    }

    /// Active attribute value of a feature, `None` when it has no data.
    pub fn value_of(&self, index: usize) -> Option<f64> {
        let feature = self.features.get(index)?;
        self.valid_value(feature, &self.active_attribute().name)
    }

    pub fn class_of(&self, index: usize) -> Class {
        match self.value_of(index) {
            Some(v) => self.scale.classify(v),
            None => Class::NoData,
        }
    }

    pub fn color_of(&self, index: usize) -> &str {
        self.scale.color_of_class(self.class_of(index))
    }

    pub fn feature_colors(&self) -> Vec<FeatureColor> {
        self.features
            .iter()
            .enumerate()
            .map(|(index, feature)| FeatureColor {
                index,
                id: feature.id.clone(),
                color: self.color_of(index).to_string(),
            })
            .collect()
    }

    pub fn legend(&self) -> Vec<LegendEntry> {
        self.scale.legend()
    }

    /// Bars for every feature with data, ascending by the active attribute.
    pub fn chart_series(&self) -> Vec<ChartBar> {
        let mut bars: Vec<ChartBar> = self
            .features
            .iter()
            .enumerate()
            .filter_map(|(index, feature)| {
                let value = self.value_of(index)?;
                Some(ChartBar {
                    index,
                    id: feature.id.clone(),
                    name: feature.display_name(self.name_property.as_deref()),
                    value,
                    color: self.scale.color(value).to_string(),
                })
            })
            .collect();
        bars.sort_by(|a, b| a.value.total_cmp(&b.value));
        bars
    }

    pub fn tooltip(&self, index: usize) -> Option<Tooltip> {
        let feature = self.features.get(index)?;
        let attribute = self.active_attribute();
        let value = self.value_of(index);
        Some(Tooltip {
            id: feature.id.clone(),
            name: feature.display_name(self.name_property.as_deref()),
            attribute: attribute.name.clone(),
            label: attribute.label().to_string(),
            value,
            text: value.map_or_else(|| "No data".to_string(), format_value),
        })
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};
    use std::sync::{Arc, Mutex};

    fn palette() -> Palette {
        Palette {
            colors: ["c1", "c2", "c3", "c4", "c5"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            no_data: "none".to_string(),
        }
    }

    fn attributes() -> Vec<AttributeConfig> {
        vec![
            AttributeConfig {
                name: "poverty_rate".to_string(),
                label: Some("Poverty rate".to_string()),
            },
            AttributeConfig {
                name: "median_income".to_string(),
                label: None,
            },
        ]
    }

    fn feature(id: &str, values: &[(&str, f64)]) -> GeoFeature {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let mut f = GeoFeature::new(Some(id.to_string()), MultiPolygon::new(vec![square]));
        for (k, v) in values {
            f.attributes.insert(k.to_string(), *v);
        }
        f
    }

    // Ten features: poverty 10..100 ascending, income 100..10 descending,
    // plus an unmatched feature and one with a non-numeric poverty cell.
    fn features() -> Vec<GeoFeature> {
        let mut features: Vec<GeoFeature> = (1..=10)
            .map(|i| {
                feature(
                    &format!("T{}", i),
                    &[
                        ("poverty_rate", (i * 10) as f64),
                        ("median_income", ((11 - i) * 10) as f64),
                    ],
                )
            })
            .collect();
        features.push(feature("UNMATCHED", &[]));
        features.push(feature("BLANK", &[("poverty_rate", f64::NAN), ("median_income", 0.0)]));
        features
    }

    fn session(policy: NoDataPolicy) -> Session {
        Session::new(features(), attributes(), palette(), policy, None).unwrap()
    }

    #[test]
    fn test_starts_on_first_attribute() {
        let s = session(NoDataPolicy::Strict);
        assert_eq!(s.active_attribute().name, "poverty_rate");
        assert_eq!(s.color_of(0), "c1");
        assert_eq!(s.color_of(9), "c5");
    }

    #[test]
    fn test_missing_values_use_fallback() {
        let s = session(NoDataPolicy::Strict);
        assert_eq!(s.class_of(10), Class::NoData);
        assert_eq!(s.class_of(11), Class::NoData);
        assert_eq!(s.color_of(10), "none");
        assert_eq!(s.color_of(11), "none");
        assert_eq!(s.scale().domain().len(), 10);
    }

    #[test]
    fn test_switch_recomputes_from_new_attribute_only() {
        let mut s = session(NoDataPolicy::Strict);
        s.select_attribute("median_income").unwrap();

        // Zero income counts as data under the strict policy
        assert_eq!(s.scale().domain().len(), 11);
        assert_eq!(s.value_of(11), Some(0.0));
        assert_eq!(s.color_of(0), "c5");
        assert_eq!(s.color_of(9), "c1");

        let fresh = QuantileScale::new(
            features()
                .iter()
                .filter_map(|f| f.attributes.get("median_income").copied()),
            palette(),
        )
        .unwrap();
        assert_eq!(s.scale(), &fresh);

        s.select_attribute("poverty_rate").unwrap();
        assert_eq!(s.scale(), session(NoDataPolicy::Strict).scale());
    }

    #[test]
    fn test_unknown_attribute_keeps_state() {
        let mut s = session(NoDataPolicy::Strict);
        let before = s.scale().clone();
        let err = s.select_attribute("rent").unwrap_err();
        assert_eq!(err, SessionError::UnknownAttribute("rent".to_string()));
        assert_eq!(s.active_attribute().name, "poverty_rate");
        assert_eq!(s.scale(), &before);
    }

    #[test]
    fn test_legacy_zero_policy_treats_zero_as_missing() {
        let mut s = session(NoDataPolicy::LegacyZero);
        s.select_attribute("median_income").unwrap();
        assert_eq!(s.value_of(11), None);
        assert_eq!(s.color_of(11), "none");
        assert_eq!(s.scale().domain().len(), 10);
    }

    #[test]
    fn test_listeners_receive_recolor() {
        let mut s = session(NoDataPolicy::Strict);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        s.subscribe(move |change: &SelectionChange| {
            sink.lock().unwrap().push(change.clone());
        });

        s.select_attribute("median_income").unwrap();
        let _ = s.select_attribute("rent");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].previous, "poverty_rate");
        assert_eq!(seen[0].current, "median_income");
        assert_eq!(seen[0].colors.len(), 12);
        assert_eq!(seen[0].colors[0].color, "c5");
        assert_eq!(seen[0].colors[10].color, "none");
    }

    #[test]
    fn test_chart_series_sorted_without_missing() {
        let mut s = session(NoDataPolicy::Strict);
        s.select_attribute("median_income").unwrap();
        let bars = s.chart_series();

        assert_eq!(bars.len(), 11);
        assert!(bars.windows(2).all(|w| w[0].value <= w[1].value));
        assert_eq!(bars[0].id.as_deref(), Some("BLANK"));
        assert_eq!(bars[10].id.as_deref(), Some("T1"));
    }

    #[test]
    fn test_tooltip() {
        let s = session(NoDataPolicy::Strict);
        let tip = s.tooltip(2).unwrap();
        assert_eq!(tip.label, "Poverty rate");
        assert_eq!(tip.name, "T3");
        assert_eq!(tip.text, "30");

        let tip = s.tooltip(10).unwrap();
        assert_eq!(tip.value, None);
        assert_eq!(tip.text, "No data");

        assert!(s.tooltip(99).is_none());
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(12.0), "12");
        assert_eq!(format_value(12.3456), "12.35");
    }
}
