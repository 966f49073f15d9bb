use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::HandlerError;

#[async_trait]
pub trait ReportRenderer: Send + Sync {
  /// Renders the report and returns where the artifact was written.
  async fn render(&self, title: &str, content: &str, task_id: Uuid) -> Result<PathBuf, HandlerError>;
}

pub fn report_path(dir: &Path, task_id: Uuid) -> PathBuf {
  dir.join(format!("report_{task_id}.pdf"))
}

/// Writes single-page PDF reports into a directory.
pub struct PdfReportRenderer {
  dir: PathBuf,
}

impl PdfReportRenderer {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }
}

#[async_trait]
impl ReportRenderer for PdfReportRenderer {
  async fn render(&self, title: &str, content: &str, task_id: Uuid) -> Result<PathBuf, HandlerError> {
    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| HandlerError::Transport(format!("create report dir {}: {e}", self.dir.display())))?;
    let path = report_path(&self.dir, task_id);
    tokio::fs::write(&path, pdf_document(title, content))
      .await
      .map_err(|e| HandlerError::Transport(format!("write report {}: {e}", path.display())))?;
    info!(%task_id, "Report written to {}", path.display());
    Ok(path)
  }
}

/// PDF literal string body: printable ASCII only, with delimiters escaped.
fn pdf_text(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '(' | ')' | '\\' => {
        out.push('\\');
        out.push(c);
      }
      ' '..='~' => out.push(c),
      '\t' => out.push(' '),
      _ => out.push('?'),
    }
  }
  out
}

fn content_stream(title: &str, content: &str) -> String {
  let mut stream = format!("BT /F2 16 Tf 100 800 Td ({}) Tj ET\n", pdf_text(title));
  stream.push_str("BT /F1 12 Tf 16 TL 100 760 Td\n");
  for (i, line) in content.lines().enumerate() {
    if i > 0 {
      stream.push_str("T* ");
    }
    stream.push_str(&format!("({}) Tj\n", pdf_text(line)));
  }
  stream.push_str("ET\n");
  stream
}

pub fn pdf_document(title: &str, content: &str) -> Vec<u8> {
  let stream = content_stream(title, content);
  let objects = [
    "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
    "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 595 842] \
     /Resources << /Font << /F1 4 0 R /F2 5 0 R >> >> /Contents 6 0 R >>"
      .to_string(),
    "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold >>".to_string(),
    format!("<< /Length {} >>\nstream\n{}endstream", stream.len(), stream),
  ];

  let mut out = String::from("%PDF-1.4\n");
  let mut offsets = Vec::with_capacity(objects.len());
  for (i, body) in objects.iter().enumerate() {
    offsets.push(out.len());
    out.push_str(&format!("{} 0 obj\n{}\nendobj\n", i + 1, body));
  }
  let xref_at = out.len();
  out.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
  for offset in offsets {
    out.push_str(&format!("{offset:010} 00000 n \n"));
  }
  out.push_str(&format!(
    "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
    objects.len() + 1,
    xref_at
  ));
  out.into_bytes()
}
