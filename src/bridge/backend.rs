// Model backend seam used by the worker loop.
//
// The bridge treats model loading and generation as opaque; a backend only
// has to turn one request into one success text or one failure reason.

use std::path::Path;
use std::thread;
use std::time::Duration;

use log::info;

/// Stateful model capability driven sequentially by the worker.
pub trait ModelBackend: Send {
    /// Load the model at `model_path`, replacing any loaded model.
    fn load_model(&mut self, model_path: &str) -> Result<String, String>;

    /// Run one message through the loaded model.
    fn send_message(&mut self, message: &str) -> Result<String, String>;
}

impl<B: ModelBackend + ?Sized> ModelBackend for Box<B> {
    fn load_model(&mut self, model_path: &str) -> Result<String, String> {
        (**self).load_model(model_path)
    }

    fn send_message(&mut self, message: &str) -> Result<String, String> {
        (**self).send_message(message)
    }
}

/// Deterministic stand-in for a real inference engine.
///
/// Loading only checks that the file exists; replies echo the message.
#[derive(Debug, Default)]
pub struct MockBackend {
    model_path: Option<String>,
    latency: Duration,
}

impl MockBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            model_path: None,
            latency,
        }
    }

    pub fn loaded_model(&self) -> Option<&str> {
        self.model_path.as_deref()
    }

    fn simulate_work(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }
}

impl ModelBackend for MockBackend {
    fn load_model(&mut self, model_path: &str) -> Result<String, String> {
        self.simulate_work();

        if !Path::new(model_path).is_file() {
            return Err(format!("model file not found: {model_path}"));
        }

        info!("Mock backend loaded {model_path}");
        self.model_path = Some(model_path.to_string());
        Ok("loaded".to_string())
    }

    fn send_message(&mut self, message: &str) -> Result<String, String> {
        let model_path = self
            .model_path
            .as_deref()
            .ok_or_else(|| "no model loaded".to_string())?;
        self.simulate_work();

        let model_name = Path::new(model_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("model");
        Ok(format!("[{model_name}] {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_load_fails() {
        let mut backend = MockBackend::default();
        assert_eq!(
            backend.send_message("hello"),
            Err("no model loaded".to_string())
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let mut backend = MockBackend::default();
        let err = backend.load_model("/no/such/model.gguf").unwrap_err();
        assert!(err.contains("not found"));
        assert!(backend.loaded_model().is_none());
    }

    #[test]
    fn test_load_then_send() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut backend = MockBackend::default();
        assert_eq!(backend.load_model(&path).unwrap(), "loaded");
        assert_eq!(backend.loaded_model(), Some(path.as_str()));

        let reply = backend.send_message("merhaba").unwrap();
        assert!(reply.ends_with("merhaba"));
    }
}
