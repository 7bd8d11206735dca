mod common;

use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{PipelineSpec, build_pipeline, two_face_image};
use facemesh_core::{FaceMeshError, FaceKeypoint, PixelBuffer, PixelFormat, embedding_distance};
use facemesh_utils::DetectionMode;
use image::{DynamicImage, ImageFormat};

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-3
}

#[test]
fn fast_mode_returns_detections_only() {
    let (pipeline, calls) = build_pipeline(PipelineSpec::default());
    let report = pipeline
        .detect(&two_face_image(), DetectionMode::Fast)
        .expect("detect");

    assert_eq!(report.faces.len(), 2);
    assert_eq!(report.image_size, (64, 64));
    assert!(report.faces.iter().all(|f| f.mesh.is_none() && f.eyes.is_none()));
    assert_eq!(calls.mesh.load(Ordering::SeqCst), 0);

    // Highest score first.
    let first = &report.faces[0].detection;
    assert!(first.score > report.faces[1].detection.score);
    assert!(close(first.bounding_box.xmin, 0.0));
    assert!(close(first.bounding_box.xmax, 0.5));
    let eye = first.keypoint(FaceKeypoint::RightEye).expect("right eye");
    assert!(close(eye.x, 0.19));
    assert!(close(eye.y, 0.2));
}

#[test]
fn full_mode_runs_mesh_and_iris_for_every_face() {
    let (pipeline, calls) = build_pipeline(PipelineSpec::default());
    let report = pipeline
        .detect(&two_face_image(), DetectionMode::Full)
        .expect("detect");

    assert_eq!(report.stats.faces, 2);
    assert_eq!(report.stats.mesh_ok, 2);
    assert_eq!(report.stats.iris_ok, 2);
    assert_eq!(calls.mesh.load(Ordering::SeqCst), 2);
    assert_eq!(calls.iris.load(Ordering::SeqCst), 4);

    let mesh = report.faces[0].mesh.as_ref().expect("mesh");
    assert_eq!(mesh.points().len(), 468);
    // Crop center lands on the face region center in image pixels.
    let center = mesh.point(0).expect("point");
    assert!(close(center.x, 16.0), "{center:?}");
    assert!(close(center.y, 13.632), "{center:?}");

    let eyes = report.faces[1].eyes.as_ref().expect("eyes");
    assert!(eyes.left.iris_radius() > 0.0);
    assert_eq!(eyes.right.mesh.len(), 71);
}

#[test]
fn standard_mode_skips_iris() {
    let (pipeline, calls) = build_pipeline(PipelineSpec::default());
    let report = pipeline
        .detect(&two_face_image(), DetectionMode::Standard)
        .expect("detect");
    assert_eq!(report.stats.mesh_ok, 2);
    assert!(report.faces.iter().all(|f| f.eyes.is_none()));
    assert_eq!(calls.iris.load(Ordering::SeqCst), 0);
}

#[test]
fn mesh_failure_is_isolated_to_its_face() {
    let (pipeline, calls) = build_pipeline(PipelineSpec {
        fail_bright_mesh: true,
        ..PipelineSpec::default()
    });
    let report = pipeline
        .detect(&two_face_image(), DetectionMode::Full)
        .expect("batch still succeeds");

    assert_eq!(report.stats.faces, 2);
    assert_eq!(report.stats.mesh_ok, 1);
    assert_eq!(report.stats.mesh_failed, 1);
    assert_eq!(report.stats.alignment_failed, 0);
    assert_eq!(report.stats.iris_ok, 1);
    assert!(report.faces[0].mesh.is_none());
    assert!(report.faces[0].eyes.is_none());
    assert!(report.faces[1].mesh.is_some());
    assert_eq!(calls.iris.load(Ordering::SeqCst), 2);
}

#[test]
fn missing_stage_reports_pool_not_initialized() {
    let (pipeline, _) = build_pipeline(PipelineSpec {
        mesh_instances: 0,
        iris: false,
        ..PipelineSpec::default()
    });
    assert!(pipeline.supports(DetectionMode::Fast));
    assert!(!pipeline.supports(DetectionMode::Standard));
    assert!(matches!(
        pipeline.detect(&two_face_image(), DetectionMode::Standard),
        Err(FaceMeshError::PoolNotInitialized)
    ));
    assert!(pipeline.detect(&two_face_image(), DetectionMode::Fast).is_ok());

    let (pipeline, _) = build_pipeline(PipelineSpec {
        iris: false,
        ..PipelineSpec::default()
    });
    assert!(matches!(
        pipeline.detect(&two_face_image(), DetectionMode::Full),
        Err(FaceMeshError::PoolNotInitialized)
    ));
    assert!(matches!(
        pipeline.segment(&two_face_image()),
        Err(FaceMeshError::PoolNotInitialized)
    ));
}

#[test]
fn small_mesh_pool_serves_many_faces() {
    let (pipeline, calls) = build_pipeline(PipelineSpec {
        faces: vec![(0, 5.0), (1, 4.0), (2, 3.0), (3, 2.0)],
        mesh_instances: 2,
        mesh_delay: Duration::from_millis(5),
        ..PipelineSpec::default()
    });
    assert_eq!(pipeline.mesh_pool_size(), 2);
    let report = pipeline
        .detect(&two_face_image(), DetectionMode::Full)
        .expect("detect");
    assert_eq!(report.stats.faces, 4);
    assert_eq!(report.stats.mesh_ok, 4);
    assert_eq!(report.stats.iris_ok, 4);
    assert_eq!(calls.mesh.load(Ordering::SeqCst), 4);
}

#[test]
fn accepts_encoded_and_raw_pixel_input() {
    let (pipeline, _) = build_pipeline(PipelineSpec::default());
    let image = two_face_image();

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .expect("encode");
    let report = pipeline
        .detect_encoded(&png, DetectionMode::Fast)
        .expect("encoded");
    assert_eq!(report.faces.len(), 2);

    let bgra = image
        .pixels()
        .flat_map(|p| [p[2], p[1], p[0], 255])
        .collect();
    let report = pipeline
        .detect_pixels(
            PixelBuffer::new(64, 64, PixelFormat::Bgra8, bgra),
            DetectionMode::Standard,
        )
        .expect("pixels");
    assert_eq!(report.stats.mesh_ok, 2);

    assert!(matches!(
        pipeline.detect_encoded(b"not an image", DetectionMode::Fast),
        Err(FaceMeshError::Decode(_))
    ));
    assert!(matches!(
        pipeline.detect_pixels(
            PixelBuffer::new(4, 4, PixelFormat::Rgb8, vec![0; 5]),
            DetectionMode::Fast
        ),
        Err(FaceMeshError::Decode(_))
    ));
}

#[test]
fn embeds_and_segments_when_models_are_present() {
    let (pipeline, _) = build_pipeline(PipelineSpec {
        extras: true,
        ..PipelineSpec::default()
    });
    let image = two_face_image();
    let report = pipeline.detect(&image, DetectionMode::Fast).expect("detect");

    let a = pipeline.embed(&image, &report.faces[0]).expect("embed");
    let b = pipeline.embed(&image, &report.faces[1]).expect("embed");
    assert_eq!(a.len(), 192);
    let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!(close(norm, 1.0));
    assert!(embedding_distance(&a, &b) < 1e-5);

    let mask = pipeline.segment(&image).expect("segment");
    assert_eq!((mask.width, mask.height), (64, 64));
    assert!(mask.get(10, 50).expect("in bounds") > 0.99);
}

#[test]
fn dispose_releases_models_once() {
    let (pipeline, _) = build_pipeline(PipelineSpec::default());
    assert_eq!(pipeline.dispose(), 5);
    assert!(pipeline.is_disposed());
    assert_eq!(pipeline.dispose(), 0);
    assert!(matches!(
        pipeline.detect(&two_face_image(), DetectionMode::Fast),
        Err(FaceMeshError::Disposed)
    ));
}
