//! Rotation-corrected square regions for faces and eyes.

use facemesh_utils::Point;

use crate::error::FaceMeshError;
use crate::landmarks::Mesh;
use crate::postprocess::{Detection, FaceKeypoint};

/// Face crop edge relative to the eye-midpoint to mouth distance.
const FACE_MOUTH_SCALE: f32 = 3.6;
/// Face crop edge relative to the inter-eye distance.
const FACE_EYE_SCALE: f32 = 4.0;
/// Fraction of the eye-to-mouth vector the face center is shifted by.
const FACE_CENTER_SHIFT: f32 = 0.1;
/// Eye crop edge relative to the eye corner distance.
pub const EYE_ROI_SCALE: f32 = 2.3;

/// Mesh indices of the subject's right eye corners (outer, inner).
pub const RIGHT_EYE_CORNERS: (usize, usize) = (33, 133);
/// Mesh indices of the subject's left eye corners (inner, outer).
pub const LEFT_EYE_CORNERS: (usize, usize) = (362, 263);

/// Square region in image pixels, rotated by `rotation` radians around its center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedRoi {
    pub center: Point,
    pub size: f32,
    pub rotation: f32,
}

impl AlignedRoi {
    pub fn new(center: Point, size: f32, rotation: f32) -> Self {
        Self {
            center,
            size,
            rotation,
        }
    }

    /// Finite geometry with a crop edge of at least one pixel.
    pub fn validate(&self) -> Result<(), FaceMeshError> {
        if !self.center.is_finite() || !self.size.is_finite() || !self.rotation.is_finite() {
            return Err(FaceMeshError::Alignment(format!("non-finite region {self:?}")));
        }
        if self.size.round() <= 0.0 {
            return Err(FaceMeshError::Alignment(format!(
                "region size {} rounds to zero",
                self.size
            )));
        }
        Ok(())
    }

    /// Map a point given in crop pixels (`0..input_size`) back to image pixels.
    ///
    /// `mirrored` undoes a horizontal flip applied to the crop before inference.
    pub fn project(&self, x: f32, y: f32, input_size: f32, mirrored: bool) -> Point {
        let u = if mirrored { input_size - x } else { x };
        let offset = Point::new(u / input_size - 0.5, y / input_size - 0.5) * self.size;
        self.center + offset.rotate(self.rotation)
    }

    /// Crop-local scale from crop pixels to image pixels.
    pub fn pixel_scale(&self, input_size: f32) -> f32 {
        self.size / input_size
    }
}

/// Face region from a detection's eye and mouth keypoints.
///
/// The detection is normalized; `width`/`height` are the image dimensions it refers to.
pub fn face_roi(
    detection: &Detection,
    width: u32,
    height: u32,
) -> Result<AlignedRoi, FaceMeshError> {
    let keypoint = |kp: FaceKeypoint| {
        detection.keypoint_px(kp, width, height).ok_or_else(|| {
            FaceMeshError::Alignment(format!(
                "detection has {} keypoints, {kp:?} missing",
                detection.num_keypoints()
            ))
        })
    };
    let right_eye = keypoint(FaceKeypoint::RightEye)?;
    let left_eye = keypoint(FaceKeypoint::LeftEye)?;
    let mouth = keypoint(FaceKeypoint::Mouth)?;

    let eye_mid = right_eye.midpoint(left_eye);
    let to_mouth = mouth - eye_mid;
    let size = (FACE_MOUTH_SCALE * to_mouth.hypot())
        .max(FACE_EYE_SCALE * right_eye.distance(left_eye));
    let roi = AlignedRoi::new(
        to_mouth.mul_add(FACE_CENTER_SHIFT, eye_mid),
        size,
        right_eye.angle_to(left_eye),
    );
    roi.validate()?;
    Ok(roi)
}

fn eye_roi(mesh: &Mesh, corners: (usize, usize)) -> Result<AlignedRoi, FaceMeshError> {
    let corner = |index: usize| {
        mesh.point(index)
            .map(|p| p.xy())
            .ok_or_else(|| FaceMeshError::Alignment(format!("mesh point {index} missing")))
    };
    let a = corner(corners.0)?;
    let b = corner(corners.1)?;
    let roi = AlignedRoi::new(a.midpoint(b), EYE_ROI_SCALE * a.distance(b), a.angle_to(b));
    roi.validate()?;
    Ok(roi)
}

/// Eye regions from the mesh eye corners, as `(right, left)` from the subject's view.
pub fn eye_rois(mesh: &Mesh) -> Result<(AlignedRoi, AlignedRoi), FaceMeshError> {
    Ok((eye_roi(mesh, RIGHT_EYE_CORNERS)?, eye_roi(mesh, LEFT_EYE_CORNERS)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::NormalizedRect;
    use facemesh_utils::Point3;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-4, "{a} != {b}");
    }

    fn detection(keypoints: Vec<f32>) -> Detection {
        Detection {
            bounding_box: NormalizedRect::new(0.2, 0.2, 0.8, 0.8),
            score: 0.9,
            keypoints,
        }
    }

    #[test]
    fn upright_face_roi() {
        // 100x100 image: eyes at (40, 40) and (60, 40), mouth at (50, 70).
        let det = detection(vec![0.4, 0.4, 0.6, 0.4, 0.5, 0.55, 0.5, 0.7]);
        let roi = face_roi(&det, 100, 100).expect("roi");
        assert_close(roi.rotation, 0.0);
        // max(3.6 * 30, 4 * 20)
        assert_close(roi.size, 108.0);
        assert_close(roi.center.x, 50.0);
        assert_close(roi.center.y, 43.0);
    }

    #[test]
    fn tilted_face_roi_follows_eye_line() {
        let det = detection(vec![0.4, 0.4, 0.5, 0.5, 0.4, 0.5, 0.4, 0.55]);
        let roi = face_roi(&det, 100, 100).expect("roi");
        assert_close(roi.rotation, std::f32::consts::FRAC_PI_4);
        assert_close(roi.size, 4.0 * (200.0f32).sqrt());
    }

    #[test]
    fn collapsed_keypoints_fail_alignment() {
        let det = detection(vec![0.5; 8]);
        assert!(matches!(
            face_roi(&det, 100, 100),
            Err(FaceMeshError::Alignment(_))
        ));
        assert!(face_roi(&detection(vec![0.4, 0.4]), 100, 100).is_err());
    }

    #[test]
    fn eye_roi_from_mesh_corners() {
        let mut points = vec![Point3::default(); Mesh::POINTS];
        points[33] = Point3::new(10.0, 20.0, 0.0);
        points[133] = Point3::new(30.0, 20.0, 0.0);
        points[362] = Point3::new(50.0, 20.0, 0.0);
        points[263] = Point3::new(50.0, 36.0, 0.0);
        let mesh = Mesh::new(points).expect("mesh");

        let (right, left) = eye_rois(&mesh).expect("eye rois");
        assert_eq!(right.size, EYE_ROI_SCALE * 20.0);
        assert_eq!(right.center, Point::new(20.0, 20.0));
        assert_eq!(right.rotation, 0.0);

        assert_eq!(left.size, EYE_ROI_SCALE * 16.0);
        assert_eq!(left.center, Point::new(50.0, 28.0));
        assert_close(left.rotation, std::f32::consts::FRAC_PI_2);
    }

    #[test]
    fn collapsed_eye_is_an_alignment_error() {
        let mesh = Mesh::new(vec![Point3::new(5.0, 5.0, 0.0); Mesh::POINTS]).expect("mesh");
        assert!(matches!(eye_rois(&mesh), Err(FaceMeshError::Alignment(_))));
    }

    #[test]
    fn project_maps_crop_corners_and_undoes_mirror() {
        let roi = AlignedRoi::new(Point::new(100.0, 50.0), 40.0, 0.0);
        let p = roi.project(0.0, 0.0, 64.0, false);
        assert_close(p.x, 80.0);
        assert_close(p.y, 30.0);
        let center = roi.project(32.0, 32.0, 64.0, true);
        assert_close(center.x, 100.0);
        let mirrored = roi.project(0.0, 64.0, 64.0, true);
        assert_close(mirrored.x, 120.0);
        assert_close(mirrored.y, 70.0);

        let rotated = AlignedRoi::new(Point::new(0.0, 0.0), 10.0, std::f32::consts::FRAC_PI_2);
        let q = rotated.project(10.0, 5.0, 10.0, false);
        assert_close(q.x, 0.0);
        assert_close(q.y, 5.0);
    }
}
