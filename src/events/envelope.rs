//! Lifecycle events and their CloudEvents envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Notification emitted by the core. Serializes to its `data` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LifecycleEvent {
    ModelLoaded {
        model_name: String,
        version: String,
        load_time_ms: f64,
    },
    ModelFailed {
        model_name: String,
        error: String,
    },
    TranslationCompleted {
        source_lang: String,
        target_lang: String,
        character_count: usize,
        user_id: Option<String>,
    },
    PredictionCompleted {
        model_type: String,
        prediction: String,
        probability: f64,
        user_id: Option<String>,
    },
    RecommendationGenerated {
        user_id: String,
        context: String,
        recommendation_count: usize,
    },
    ImageAnalyzed {
        analysis_type: String,
        findings_count: usize,
        user_id: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn model_loaded(name: impl Into<String>, version: impl Into<String>, load_time_ms: f64) -> Self {
        Self::ModelLoaded {
            model_name: name.into(),
            version: version.into(),
            load_time_ms,
        }
    }

    pub fn model_failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ModelFailed {
            model_name: name.into(),
            error: error.into(),
        }
    }

    /// `character_count` is taken from `text` in characters, not bytes.
    pub fn translation_completed(
        text: &str,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self::TranslationCompleted {
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            character_count: text.chars().count(),
            user_id,
        }
    }

    pub fn prediction_completed(
        model_type: impl Into<String>,
        prediction: impl Into<String>,
        probability: f64,
        user_id: Option<String>,
    ) -> Self {
        Self::PredictionCompleted {
            model_type: model_type.into(),
            prediction: prediction.into(),
            probability,
            user_id,
        }
    }

    pub fn recommendation_generated(
        user_id: impl Into<String>,
        context: impl Into<String>,
        recommendation_count: usize,
    ) -> Self {
        Self::RecommendationGenerated {
            user_id: user_id.into(),
            context: context.into(),
            recommendation_count,
        }
    }

    pub fn image_analyzed(analysis_type: impl Into<String>, findings_count: usize, user_id: Option<String>) -> Self {
        Self::ImageAnalyzed {
            analysis_type: analysis_type.into(),
            findings_count,
            user_id,
        }
    }

    /// Event name without the topic prefix, e.g. `model.loaded`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModelLoaded { .. } => "model.loaded",
            Self::ModelFailed { .. } => "model.failed",
            Self::TranslationCompleted { .. } => "translation.completed",
            Self::PredictionCompleted { .. } => "prediction.completed",
            Self::RecommendationGenerated { .. } => "recommendation.generated",
            Self::ImageAnalyzed { .. } => "image.analyzed",
        }
    }

    pub fn data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// CloudEvents 1.0 structured-mode envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub id: String,
    pub time: DateTime<Utc>,
    pub data: Value,
}

impl CloudEvent {
    /// Wrap `event` as `{prefix}.{event_type}` from `/{service}`.
    pub fn wrap(prefix: &str, service: &str, event: &LifecycleEvent) -> Self {
        let event_type = if prefix.is_empty() {
            event.event_type().to_string()
        } else {
            format!("{}.{}", prefix, event.event_type())
        };
        Self {
            specversion: "1.0".to_string(),
            event_type,
            source: format!("/{}", service),
            id: uuid::Uuid::new_v4().to_string(),
            time: Utc::now(),
            data: event.data(),
        }
    }
}
