//! Generation cost estimation
//!
//! Catalog-based pricing applied at charge time. The estimate feeds the
//! monthly usage bucket and the platform cost record; provider-measured
//! cost is filled in later by the reconciler and never replaces it.

use serde::{Deserialize, Serialize};

/// Flat price used for models missing from the catalog
pub const FALLBACK_PRICE_PER_IMAGE: f64 = 0.03;

/// How a model is priced
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingMode {
    /// Fixed price per output image
    Flat { per_image: f64 },
    /// Price per output megapixel, plus a surcharge per reference image
    PerMegapixel {
        per_megapixel: f64,
        input_image_surcharge: f64,
    },
}

/// One catalog row
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub model: &'static str,
    pub mode: PricingMode,
}

const CATALOG: &[ModelPrice] = &[
    ModelPrice {
        model: "black-forest-labs/flux-schnell",
        mode: PricingMode::Flat { per_image: 0.003 },
    },
    ModelPrice {
        model: "black-forest-labs/flux-dev",
        mode: PricingMode::Flat { per_image: 0.025 },
    },
    ModelPrice {
        model: "black-forest-labs/flux-1.1-pro",
        mode: PricingMode::Flat { per_image: 0.04 },
    },
    ModelPrice {
        model: "black-forest-labs/flux-1.1-pro-ultra",
        mode: PricingMode::Flat { per_image: 0.06 },
    },
    ModelPrice {
        model: "black-forest-labs/flux-kontext-pro",
        mode: PricingMode::Flat { per_image: 0.04 },
    },
    ModelPrice {
        model: "black-forest-labs/flux-2-pro",
        mode: PricingMode::PerMegapixel {
            per_megapixel: 0.015,
            input_image_surcharge: 0.015,
        },
    },
    ModelPrice {
        model: "black-forest-labs/flux-2-dev",
        mode: PricingMode::PerMegapixel {
            per_megapixel: 0.012,
            input_image_surcharge: 0.006,
        },
    },
    ModelPrice {
        model: "google/nano-banana",
        mode: PricingMode::Flat { per_image: 0.039 },
    },
    ModelPrice {
        model: "bytedance/seedream-4",
        mode: PricingMode::Flat { per_image: 0.03 },
    },
    ModelPrice {
        model: "ideogram-ai/ideogram-v3-turbo",
        mode: PricingMode::Flat { per_image: 0.03 },
    },
    ModelPrice {
        model: "recraft-ai/recraft-v3",
        mode: PricingMode::Flat { per_image: 0.04 },
    },
    ModelPrice {
        model: "stability-ai/stable-diffusion-3.5-large",
        mode: PricingMode::Flat { per_image: 0.065 },
    },
];

/// Cost-relevant shape of a generation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationShape {
    pub num_outputs: Option<u32>,
    /// Free-form label such as `"2 MP"` or `"4K"`
    pub resolution: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub has_image_input: bool,
    pub input_image_count: Option<u32>,
}

impl GenerationShape {
    pub fn outputs(&self) -> u32 {
        self.num_outputs.unwrap_or(1).max(1)
    }

    /// Output megapixels per image.
    ///
    /// `"N MP"` is taken verbatim, `"NK"` goes through a fixed lookup,
    /// otherwise width×height is used, and 1 MP when nothing is given.
    pub fn megapixels(&self) -> f64 {
        if let Some(mp) = self.resolution.as_deref().and_then(parse_resolution) {
            return mp;
        }
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w as f64 * h as f64) / 1_000_000.0,
            _ => 1.0,
        }
    }

    fn reference_images(&self) -> u32 {
        if !self.has_image_input {
            return 0;
        }
        self.input_image_count.unwrap_or(1)
    }
}

/// Parse a resolution label into megapixels, if it uses a recognised form.
pub fn parse_resolution(label: &str) -> Option<f64> {
    let normalized = label.trim().to_ascii_uppercase();

    if let Some(number) = normalized.strip_suffix("MP") {
        return number
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|mp| mp.is_finite() && *mp > 0.0);
    }

    // Encoder output sizes are not linear in the K label
    match normalized.as_str() {
        "1K" => Some(1.0),
        "2K" => Some(2.0),
        "4K" => Some(8.0),
        _ => None,
    }
}

/// Catalog-based cost estimator
#[derive(Debug, Clone, Copy, Default)]
pub struct CostEstimator;

impl CostEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Look up a model's catalog entry
    pub fn price_for(&self, model: &str) -> Option<PricingMode> {
        CATALOG.iter().find(|p| p.model == model).map(|p| p.mode)
    }

    /// Estimated cost in USD. Unknown models get the fallback flat price.
    pub fn estimate(&self, model: &str, shape: &GenerationShape) -> f64 {
        let outputs = shape.outputs() as f64;

        match self.price_for(model) {
            Some(PricingMode::Flat { per_image }) => per_image * outputs,
            Some(PricingMode::PerMegapixel {
                per_megapixel,
                input_image_surcharge,
            }) => {
                per_megapixel * shape.megapixels() * outputs
                    + input_image_surcharge * shape.reference_images() as f64
            }
            None => {
                tracing::debug!(model = %model, "No catalog price for model, using fallback");
                FALLBACK_PRICE_PER_IMAGE * outputs
            }
        }
    }

    /// All priced models, for operator display
    pub fn catalog(&self) -> &'static [ModelPrice] {
        CATALOG
    }
}
