//! Mesh and iris landmark stages.
//!
//! Both stages take an [`AlignedCrop`] at the model's input size and project the raw
//! crop-pixel landmarks back into image pixels.

use facemesh_utils::Point3;
use serde::{Deserialize, Serialize};

use crate::crop::AlignedCrop;
use crate::error::{FaceMeshError, Stage};
use crate::model::{InferenceModel, InputSpec, OutputTensor, TensorBuffer};

/// Dense 3D face mesh in image pixels. `z` is relative depth at the same scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    points: Vec<Point3>,
}

impl Mesh {
    pub const POINTS: usize = 468;

    pub fn new(points: Vec<Point3>) -> Result<Self, FaceMeshError> {
        if points.len() != Self::POINTS {
            return Err(FaceMeshError::invalid_output(
                Stage::Mesh,
                format!("mesh has {} points, expected {}", points.len(), Self::POINTS),
            ));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    pub fn point(&self, index: usize) -> Option<Point3> {
        self.points.get(index).copied()
    }
}

/// Landmarks of one eye in image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EyeLandmarks {
    pub iris_center: Point3,
    pub iris_contour: [Point3; 4],
    /// The first 15 eye mesh points trace the eyelids.
    pub eyelid_contour: Vec<Point3>,
    pub mesh: Vec<Point3>,
}

impl EyeLandmarks {
    pub const MESH_POINTS: usize = 71;
    pub const EYELID_POINTS: usize = 15;
    pub const IRIS_POINTS: usize = 5;

    /// Mean iris radius in pixels, from the center to the four contour points.
    pub fn iris_radius(&self) -> f32 {
        let center = self.iris_center.xy();
        self.iris_contour
            .iter()
            .map(|p| p.xy().distance(center))
            .sum::<f32>()
            / 4.0
    }
}

fn check_input(spec: InputSpec, stage: Stage) -> Result<(), FaceMeshError> {
    if spec.size.width != spec.size.height || spec.size.width == 0 {
        return Err(FaceMeshError::Initialization(anyhow::anyhow!(
            "{stage} model input must be square, got {}x{}",
            spec.size.width,
            spec.size.height
        )));
    }
    Ok(())
}

fn run_crop<M: InferenceModel>(
    model: &mut M,
    buffer: &mut TensorBuffer,
    crop: &AlignedCrop,
    stage: Stage,
) -> Result<Vec<OutputTensor>, FaceMeshError> {
    buffer
        .fill(&crop.pixels)
        .map_err(|e| FaceMeshError::inference(stage, e))?;
    model
        .run(buffer)
        .map_err(|e| FaceMeshError::inference(stage, e))
}

/// Reads `count` xyz triples starting at triple `offset`, projected through `crop`.
fn project_points(crop: &AlignedCrop, data: &[f32], offset: usize, count: usize) -> Vec<Point3> {
    let z_scale = crop.roi.pixel_scale(crop.size() as f32);
    data[offset * 3..(offset + count) * 3]
        .chunks_exact(3)
        .map(|xyz| {
            let p = crop.project(xyz[0], xyz[1]);
            Point3::new(p.x, p.y, xyz[2] * z_scale)
        })
        .collect()
}

/// Face mesh model instance with its own reusable input buffer.
#[derive(Debug)]
pub struct MeshModel<M> {
    model: M,
    buffer: TensorBuffer,
}

impl<M: InferenceModel> MeshModel<M> {
    pub fn new(model: M) -> Result<Self, FaceMeshError> {
        let spec = model.input_spec();
        check_input(spec, Stage::Mesh)?;
        Ok(Self {
            model,
            buffer: TensorBuffer::new(spec),
        })
    }

    /// Edge length of the square crop the model expects.
    pub fn input_size(&self) -> u32 {
        self.buffer.spec().size.width
    }

    pub fn infer(&mut self, crop: &AlignedCrop) -> Result<Mesh, FaceMeshError> {
        let outputs = run_crop(&mut self.model, &mut self.buffer, crop, Stage::Mesh)?;
        let needed = Mesh::POINTS * 3;
        let landmarks = outputs
            .iter()
            .find(|t| t.len() >= needed)
            .ok_or_else(|| {
                FaceMeshError::invalid_output(
                    Stage::Mesh,
                    format!(
                        "no output holds {needed} values (got lengths {:?})",
                        outputs.iter().map(OutputTensor::len).collect::<Vec<_>>()
                    ),
                )
            })?;
        Mesh::new(project_points(crop, &landmarks.data, 0, Mesh::POINTS))
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

/// Iris model instance. Trained on one eye; the other eye's crop arrives mirrored.
#[derive(Debug)]
pub struct IrisModel<M> {
    model: M,
    buffer: TensorBuffer,
}

impl<M: InferenceModel> IrisModel<M> {
    const EYE_VALUES: usize = EyeLandmarks::MESH_POINTS * 3;
    const IRIS_VALUES: usize = EyeLandmarks::IRIS_POINTS * 3;

    pub fn new(model: M) -> Result<Self, FaceMeshError> {
        let spec = model.input_spec();
        check_input(spec, Stage::Iris)?;
        Ok(Self {
            model,
            buffer: TensorBuffer::new(spec),
        })
    }

    pub fn input_size(&self) -> u32 {
        self.buffer.spec().size.width
    }

    pub fn infer(&mut self, crop: &AlignedCrop) -> Result<EyeLandmarks, FaceMeshError> {
        let outputs = run_crop(&mut self.model, &mut self.buffer, crop, Stage::Iris)?;
        let by_len = |len: usize| outputs.iter().find(|t| t.len() == len);

        let (eye_mesh, iris) = match (by_len(Self::EYE_VALUES), by_len(Self::IRIS_VALUES)) {
            (Some(eye), Some(iris)) => (
                project_points(crop, &eye.data, 0, EyeLandmarks::MESH_POINTS),
                project_points(crop, &iris.data, 0, EyeLandmarks::IRIS_POINTS),
            ),
            _ => {
                // Single concatenated output: eye mesh followed by iris.
                let joined = outputs
                    .iter()
                    .find(|t| t.len() >= Self::EYE_VALUES + Self::IRIS_VALUES)
                    .ok_or_else(|| {
                        FaceMeshError::invalid_output(
                            Stage::Iris,
                            format!(
                                "expected outputs of {} and {} values, got lengths {:?}",
                                Self::EYE_VALUES,
                                Self::IRIS_VALUES,
                                outputs.iter().map(OutputTensor::len).collect::<Vec<_>>()
                            ),
                        )
                    })?;
                (
                    project_points(crop, &joined.data, 0, EyeLandmarks::MESH_POINTS),
                    project_points(
                        crop,
                        &joined.data,
                        EyeLandmarks::MESH_POINTS,
                        EyeLandmarks::IRIS_POINTS,
                    ),
                )
            }
        };

        Ok(EyeLandmarks {
            iris_center: iris[0],
            iris_contour: [iris[1], iris[2], iris[3], iris[4]],
            eyelid_contour: eye_mesh[..EyeLandmarks::EYELID_POINTS].to_vec(),
            mesh: eye_mesh,
        })
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::AlignedRoi;
    use crate::crop::extract_aligned_crop;
    use crate::model::InputRange;
    use crate::preprocess::InputSize;
    use facemesh_utils::{Point, TensorLayout};
    use image::RgbImage;

    struct Scripted {
        spec: InputSpec,
        outputs: Vec<OutputTensor>,
    }

    impl InferenceModel for Scripted {
        fn input_spec(&self) -> InputSpec {
            self.spec
        }

        fn run(&mut self, _input: &TensorBuffer) -> anyhow::Result<Vec<OutputTensor>> {
            Ok(self.outputs.clone())
        }
    }

    fn spec(edge: u32) -> InputSpec {
        InputSpec::new(InputSize::square(edge), TensorLayout::Nhwc, InputRange::SignedUnit)
    }

    fn crop(edge: u32) -> AlignedCrop {
        let image = RgbImage::new(64, 64);
        let roi = AlignedRoi::new(Point::new(32.0, 32.0), 32.0, 0.0);
        extract_aligned_crop(&image, &roi, edge).expect("crop")
    }

    #[test]
    fn mesh_points_are_projected_into_image() {
        let mut data = vec![0.0f32; Mesh::POINTS * 3];
        // Crop center -> image center; crop corner -> roi corner.
        data[..3].copy_from_slice(&[8.0, 8.0, 2.0]);
        data[3..6].copy_from_slice(&[16.0, 16.0, 0.0]);
        let mut model = MeshModel::new(Scripted {
            spec: spec(16),
            outputs: vec![
                OutputTensor::new(vec![1], vec![0.9]),
                OutputTensor::new(vec![1, 1404], data),
            ],
        })
        .expect("mesh model");
        assert_eq!(model.input_size(), 16);

        let mesh = model.infer(&crop(16)).expect("mesh");
        assert_eq!(mesh.points().len(), Mesh::POINTS);
        let p0 = mesh.point(0).expect("p0");
        assert!((p0.x - 32.0).abs() < 1e-4 && (p0.y - 32.0).abs() < 1e-4);
        assert!((p0.z - 4.0).abs() < 1e-4);
        let p1 = mesh.point(1).expect("p1");
        assert!((p1.x - 48.0).abs() < 1e-4 && (p1.y - 48.0).abs() < 1e-4);
    }

    #[test]
    fn short_mesh_output_is_invalid() {
        let mut model = MeshModel::new(Scripted {
            spec: spec(16),
            outputs: vec![OutputTensor::new(vec![1, 1400], vec![0.0; 1400])],
        })
        .expect("mesh model");
        assert!(matches!(
            model.infer(&crop(16)),
            Err(FaceMeshError::InvalidOutput {
                stage: Stage::Mesh,
                ..
            })
        ));
    }

    #[test]
    fn crop_size_mismatch_is_an_inference_error() {
        let mut model = MeshModel::new(Scripted {
            spec: spec(16),
            outputs: vec![],
        })
        .expect("mesh model");
        assert!(matches!(
            model.infer(&crop(8)),
            Err(FaceMeshError::Inference {
                stage: Stage::Mesh,
                ..
            })
        ));
    }

    #[test]
    fn non_square_models_are_rejected() {
        let result = MeshModel::new(Scripted {
            spec: InputSpec::new(InputSize::new(16, 8), TensorLayout::Nhwc, InputRange::Unit),
            outputs: vec![],
        });
        assert!(matches!(result, Err(FaceMeshError::Initialization(_))));
    }

    #[test]
    fn iris_outputs_identified_by_length_and_unmirrored() {
        let mut iris = vec![0.0f32; 15];
        iris[..3].copy_from_slice(&[4.0, 8.0, 0.0]);
        let eye = vec![8.0f32; 213];
        let mut model = IrisModel::new(Scripted {
            spec: spec(16),
            outputs: vec![
                OutputTensor::new(vec![1, 15], iris.clone()),
                OutputTensor::new(vec![1, 213], eye),
            ],
        })
        .expect("iris model");

        let plain = model.infer(&crop(16)).expect("plain");
        assert!((plain.iris_center.x - 24.0).abs() < 1e-4);
        assert!((plain.iris_center.y - 32.0).abs() < 1e-4);
        assert_eq!(plain.eyelid_contour.len(), 15);
        assert_eq!(plain.mesh.len(), 71);

        let mirrored = model.infer(&crop(16).mirrored()).expect("mirrored");
        assert!((mirrored.iris_center.x - 40.0).abs() < 1e-4);
        assert!((mirrored.iris_center.y - 32.0).abs() < 1e-4);
    }

    #[test]
    fn concatenated_iris_output_is_split() {
        let mut joined = vec![0.0f32; 228];
        joined[213..216].copy_from_slice(&[8.0, 8.0, 0.0]);
        let mut model = IrisModel::new(Scripted {
            spec: spec(16),
            outputs: vec![OutputTensor::new(vec![1, 228], joined)],
        })
        .expect("iris model");
        let eye = model.infer(&crop(16)).expect("eye");
        assert!((eye.iris_center.x - 32.0).abs() < 1e-4);
        assert!(eye.iris_radius() > 0.0);

        let mut broken = IrisModel::new(Scripted {
            spec: spec(16),
            outputs: vec![OutputTensor::new(vec![1, 15], vec![0.0; 15])],
        })
        .expect("iris model");
        assert!(broken.infer(&crop(16)).is_err());
    }
}
