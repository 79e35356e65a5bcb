use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Side length the classifier was trained on.
pub const IMAGE_SIZE: u32 = 224;

/// Scores strictly above this are reported as cancer.
pub const CANCER_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Cancer,
    #[serde(rename = "Non-cancer")]
    NonCancer,
}

impl Verdict {
    pub fn from_score(score: f32) -> Self {
        if score > CANCER_THRESHOLD {
            Verdict::Cancer
        } else {
            Verdict::NonCancer
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            Verdict::Cancer => "Please consult a doctor immediately!",
            Verdict::NonCancer => "No cancer detected.",
        }
    }
}

/// Anything that turns raw image bytes into a single probability-like score.
///
/// Implementations are shared across requests and called from blocking worker
/// threads, so they must not rely on interior locking for correctness.
pub trait Classifier: Send + Sync {
    fn score(&self, image_data: &[u8]) -> Result<f32>;
}

/// Decode, resize to `IMAGE_SIZE` x `IMAGE_SIZE` RGB with a bilinear filter and
/// scale into `[0, 1]`. Output is laid out HWC, ready for a `[1, H, W, 3]` tensor.
pub fn preprocess_image(image_data: &[u8]) -> Result<Vec<f32>> {
    let img = image::load_from_memory(image_data)?;
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle);

    let mut flat_img = Vec::with_capacity((IMAGE_SIZE * IMAGE_SIZE * 3) as usize);
    for pixel in resized.pixels() {
        flat_img.push(pixel[0] as f32 / 255.0);
        flat_img.push(pixel[1] as f32 / 255.0);
        flat_img.push(pixel[2] as f32 / 255.0);
    }

    Ok(flat_img)
}

#[cfg(feature = "tensorflow")]
pub use self::tf::Model;

#[cfg(feature = "tensorflow")]
mod tf {
    use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};

    use super::{preprocess_image, Classifier, IMAGE_SIZE};
    use crate::{Error, Result};

    /// Frozen TensorFlow graph with a sigmoid head. Loaded once, then shared.
    pub struct Model {
        session: Session,
        graph: Graph,
        input_op: String,
        output_op: String,
    }

    impl Model {
        pub fn new(model_path: &str, input_op: &str, output_op: &str) -> Result<Self> {
            let model_bytes = std::fs::read(model_path)?;

            let mut graph = Graph::new();
            graph
                .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
                .map_err(|e| Error::inference(format!("failed to import graph: {}", e)))?;

            let session = Session::new(&SessionOptions::new(), &graph)
                .map_err(|e| Error::inference(format!("failed to create session: {}", e)))?;

            let model = Model {
                session,
                graph,
                input_op: input_op.to_string(),
                output_op: output_op.to_string(),
            };

            // Fail at startup rather than on the first request.
            model.operation(&model.input_op)?;
            model.operation(&model.output_op)?;

            Ok(model)
        }

        fn operation(&self, name: &str) -> Result<tensorflow::Operation> {
            self.graph
                .operation_by_name(name)
                .map_err(|e| Error::inference(format!("failed to look up '{}': {}", name, e)))?
                .ok_or_else(|| Error::inference(format!("operation '{}' not found in graph", name)))
        }
    }

    impl Classifier for Model {
        fn score(&self, image_data: &[u8]) -> Result<f32> {
            let flat_img = preprocess_image(image_data)?;

            let size = IMAGE_SIZE as u64;
            let mut input_tensor = Tensor::<f32>::new(&[1, size, size, 3]);
            input_tensor.copy_from_slice(&flat_img);

            let input_operation = self.operation(&self.input_op)?;
            let output_operation = self.operation(&self.output_op)?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&input_operation, 0, &input_tensor);
            let output_token = args.request_fetch(&output_operation, 0);

            self.session
                .run(&mut args)
                .map_err(|e| Error::inference(format!("session run failed: {}", e)))?;

            let output_tensor: Tensor<f32> = args
                .fetch(output_token)
                .map_err(|e| Error::inference(format!("failed to fetch output: {}", e)))?;

            output_tensor
                .first()
                .copied()
                .ok_or_else(|| Error::inference("model produced an empty output"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
    use std::io::Cursor;

    fn encode_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb(color)));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn threshold_is_strictly_greater_than_half() {
        assert_eq!(Verdict::from_score(0.5), Verdict::NonCancer);
        assert_eq!(Verdict::from_score(0.5001), Verdict::Cancer);
        assert_eq!(Verdict::from_score(0.0), Verdict::NonCancer);
        assert_eq!(Verdict::from_score(1.0), Verdict::Cancer);
    }

    #[test]
    fn verdict_serializes_to_display_names() {
        assert_eq!(serde_json::to_string(&Verdict::Cancer).unwrap(), "\"Cancer\"");
        assert_eq!(
            serde_json::to_string(&Verdict::NonCancer).unwrap(),
            "\"Non-cancer\""
        );
        let parsed: Verdict = serde_json::from_str("\"Non-cancer\"").unwrap();
        assert_eq!(parsed, Verdict::NonCancer);
    }

    #[test]
    fn each_verdict_has_its_own_suggestion() {
        assert_ne!(Verdict::Cancer.suggestion(), Verdict::NonCancer.suggestion());
    }

    #[test]
    fn preprocess_resizes_and_normalizes() {
        let png = encode_png(50, 30, [255, 0, 51]);
        let flat = preprocess_image(&png).unwrap();

        assert_eq!(flat.len(), (IMAGE_SIZE * IMAGE_SIZE * 3) as usize);
        assert!(flat.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((flat[0] - 1.0).abs() < 1e-6);
        assert!(flat[1].abs() < 1e-6);
        assert!((flat[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn preprocess_rejects_garbage() {
        let err = preprocess_image(b"definitely not an image").unwrap_err();
        assert!(!err.is_client_error());
    }
}
