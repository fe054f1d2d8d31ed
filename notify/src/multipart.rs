//! multipart/form-data body builder.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Builds a multipart body part by part; [`finish`](Multipart::finish)
/// appends the closing boundary and yields the raw bytes.
pub struct Multipart {
    boundary: String,
    body: Vec<u8>,
}

fn generate_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("------------------------{:08x}{:08x}", nanos, n)
}

impl Multipart {
    pub fn new() -> Self {
        Self::with_boundary(generate_boundary())
    }

    /// Fixed boundary, for deterministic rendering.
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            body: Vec::new(),
        }
    }

    /// `Content-Type` header value for the request carrying this body.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}; charset=utf-8", self.boundary)
    }

    /// Append a plain text part.
    pub fn add_text(&mut self, name: &str, value: &str) -> &mut Self {
        let mut head = String::new();
        let _ = write!(
            head,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n",
            self.boundary, name
        );
        self.body.extend_from_slice(head.as_bytes());
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Append a file part, reading the file's contents now. The part's
    /// filename is the path's basename and `content_type` goes out as-is.
    pub fn add_file(&mut self, name: &str, path: &Path, content_type: &str) -> Result<&mut Self> {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut head = String::new();
        let _ = write!(
            head,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            self.boundary, name, filename, content_type
        );
        self.body.extend_from_slice(head.as_bytes());
        self.body.extend_from_slice(&data);
        self.body.extend_from_slice(b"\r\n");
        Ok(self)
    }

    /// Close the body and return the bytes to send.
    pub fn finish(mut self) -> Vec<u8> {
        let closing = format!("--{}--\r\n", self.boundary);
        self.body.extend_from_slice(closing.as_bytes());
        self.body
    }
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn text_parts_render_in_order() {
        let mut form = Multipart::with_boundary("XBOUND");
        form.add_text("chat_id", "42").add_text("text", "hello");
        let body = String::from_utf8(form.finish()).unwrap();
        assert_eq!(
            body,
            "--XBOUND\r\n\
             Content-Disposition: form-data; name=\"chat_id\"\r\n\r\n\
             42\r\n\
             --XBOUND\r\n\
             Content-Disposition: form-data; name=\"text\"\r\n\r\n\
             hello\r\n\
             --XBOUND--\r\n"
        );
    }

    #[test]
    fn content_type_names_the_boundary() {
        let form = Multipart::with_boundary("XBOUND");
        assert_eq!(
            form.content_type(),
            "multipart/form-data; boundary=XBOUND; charset=utf-8"
        );
    }

    #[test]
    fn file_part_carries_filename_and_type() {
        let dir = std::env::temp_dir();
        let path = dir.join("multipart_render_test.jpg");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"\xFF\xD8jpegdata").unwrap();
        drop(f);

        let mut form = Multipart::with_boundary("XBOUND");
        form.add_file("photo", &path, "image").unwrap();
        let body = form.finish();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(
            "Content-Disposition: form-data; name=\"photo\"; filename=\"multipart_render_test.jpg\"\r\n"
        ));
        assert!(text.contains("Content-Type: image\r\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut form = Multipart::new();
        assert!(form
            .add_file("photo", Path::new("/nonexistent/file.jpg"), "image")
            .is_err());
    }

    #[test]
    fn generated_boundaries_differ() {
        assert_ne!(Multipart::new().boundary, Multipart::new().boundary);
    }
}
