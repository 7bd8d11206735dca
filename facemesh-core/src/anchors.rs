//! SSD anchor grids.
//!
//! Box decoding indexes anchors positionally, so the order produced here must match
//! the order the detector emits its rows in: layer groups in stride order, cells in
//! row-major order, and the per-cell repeats innermost.

use facemesh_utils::config::DetectorVariant;

use crate::error::FaceMeshError;

/// Static anchor configuration a detector was trained with.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorConfig {
    pub num_layers: usize,
    pub strides: Vec<u32>,
    pub input_width: u32,
    pub input_height: u32,
    pub anchor_offset_x: f32,
    pub anchor_offset_y: f32,
    /// `1.0` adds one extra interpolated-aspect anchor per layer and cell.
    pub interpolated_scale_aspect_ratio: f32,
}

impl AnchorConfig {
    /// 128x128 configuration shared by the front camera and short-range detectors.
    pub fn front_camera() -> Self {
        Self {
            num_layers: 4,
            strides: vec![8, 16, 16, 16],
            input_width: 128,
            input_height: 128,
            anchor_offset_x: 0.5,
            anchor_offset_y: 0.5,
            interpolated_scale_aspect_ratio: 1.0,
        }
    }

    pub fn back_camera() -> Self {
        Self {
            num_layers: 4,
            strides: vec![16, 32, 32, 32],
            input_width: 256,
            input_height: 256,
            anchor_offset_x: 0.5,
            anchor_offset_y: 0.5,
            interpolated_scale_aspect_ratio: 1.0,
        }
    }

    pub fn full_range() -> Self {
        Self {
            num_layers: 1,
            strides: vec![4],
            input_width: 192,
            input_height: 192,
            anchor_offset_x: 0.5,
            anchor_offset_y: 0.5,
            interpolated_scale_aspect_ratio: 0.0,
        }
    }

    pub fn for_variant(variant: DetectorVariant) -> Self {
        match variant {
            DetectorVariant::FrontCamera | DetectorVariant::ShortRange => Self::front_camera(),
            DetectorVariant::BackCamera => Self::back_camera(),
            DetectorVariant::FullRange | DetectorVariant::FullRangeSparse => Self::full_range(),
        }
    }

    /// Reject configurations that cannot describe a grid.
    pub fn validate(&self) -> Result<(), FaceMeshError> {
        let invalid = |reason: String| {
            FaceMeshError::Initialization(anyhow::anyhow!("invalid anchor config: {reason}"))
        };
        if self.strides.len() != self.num_layers {
            return Err(invalid(format!(
                "{} strides for {} layers",
                self.strides.len(),
                self.num_layers
            )));
        }
        if self.num_layers == 0 {
            return Err(invalid("no layers".into()));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(invalid("zero input size".into()));
        }
        if self.strides.contains(&0) {
            return Err(invalid("zero stride".into()));
        }
        Ok(())
    }

    fn repeats_per_layer(&self) -> usize {
        if self.interpolated_scale_aspect_ratio == 1.0 { 2 } else { 1 }
    }

    /// Anchor count the grid will contain.
    pub fn anchor_count(&self) -> usize {
        self.layer_groups()
            .map(|(stride, layers)| {
                let (cols, rows) = self.feature_map(stride);
                cols * rows * layers * self.repeats_per_layer()
            })
            .sum()
    }

    fn feature_map(&self, stride: u32) -> (usize, usize) {
        (
            self.input_width.div_ceil(stride) as usize,
            self.input_height.div_ceil(stride) as usize,
        )
    }

    /// Consecutive layers sharing a stride, as `(stride, layer_count)`.
    fn layer_groups(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        let strides = &self.strides[..self.num_layers.min(self.strides.len())];
        let mut index = 0;
        std::iter::from_fn(move || {
            let stride = *strides.get(index)?;
            let start = index;
            while strides.get(index) == Some(&stride) {
                index += 1;
            }
            Some((stride, index - start))
        })
    }
}

/// Anchor center in normalized input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub x_center: f32,
    pub y_center: f32,
}

/// Immutable anchor list, computed once per detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGrid {
    anchors: Vec<Anchor>,
}

impl AnchorGrid {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Anchor> {
        self.anchors.get(index).copied()
    }

    pub fn as_slice(&self) -> &[Anchor] {
        &self.anchors
    }
}

/// Generate the anchor grid for `config`.
///
/// Pure and total: zero strides or sizes simply contribute no anchors. Callers that
/// need a usable grid validate the config first.
pub fn generate_anchors(config: &AnchorConfig) -> AnchorGrid {
    let repeats = config.repeats_per_layer();
    let mut anchors = Vec::with_capacity(config.anchor_count());

    for (stride, layers) in config.layer_groups() {
        if stride == 0 {
            continue;
        }
        let (cols, rows) = config.feature_map(stride);
        let per_cell = layers * repeats;
        for y in 0..rows {
            let y_center = (y as f32 + config.anchor_offset_y) / rows as f32;
            for x in 0..cols {
                let x_center = (x as f32 + config.anchor_offset_x) / cols as f32;
                anchors.extend(std::iter::repeat_n(Anchor { x_center, y_center }, per_cell));
            }
        }
    }

    AnchorGrid { anchors }
}
