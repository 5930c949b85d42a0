//! PDF text extraction module using PDFium
//! Returns one text block per page so downstream nodes keep a page map

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("PDFium library not found")]
    LibraryNotFound,
    #[error("Failed to load PDFium: {0}")]
    LoadFailed(String),
    #[error("Failed to open PDF: {0}")]
    OpenFailed(String),
    #[error("Page error: {0}")]
    PageError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// PDF text extractor using PDFium
pub struct PdfExtractor {
    pdfium_path: Option<PathBuf>,
}

impl PdfExtractor {
    /// Create a new PDF extractor
    pub fn new() -> Self {
        let pdfium_path = Self::find_pdfium();
        Self { pdfium_path }
    }

    /// Find the PDFium library next to the binary, in resources, or via env
    fn find_pdfium() -> Option<PathBuf> {
        let lib_name = pdfium_name();

        let dev_paths = [
            PathBuf::from(format!("resources/pdfium/{}", lib_name)),
            PathBuf::from(format!("./resources/pdfium/{}", lib_name)),
        ];
        for path in &dev_paths {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(dir) = exe_path.parent() {
                let candidate = dir.join("pdfium").join(lib_name);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }

        if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
            let p = PathBuf::from(&path);
            if p.exists() {
                return Some(p);
            }
        }

        None
    }

    /// Check if PDFium is available
    pub fn is_available(&self) -> bool {
        self.pdfium_path.is_some()
    }

    /// Get the PDFium library path
    pub fn library_path(&self) -> Option<&Path> {
        self.pdfium_path.as_deref()
    }

    fn bind(&self) -> Result<pdfium_render::prelude::Pdfium, PdfError> {
        let pdfium_path = self.pdfium_path.as_ref().ok_or(PdfError::LibraryNotFound)?;
        Ok(pdfium_render::prelude::Pdfium::new(
            pdfium_render::prelude::Pdfium::bind_to_library(
                pdfium_render::prelude::Pdfium::pdfium_platform_library_name_at_path(
                    pdfium_path.parent().unwrap_or(Path::new(".")),
                ),
            )
            .map_err(|e| PdfError::LoadFailed(e.to_string()))?,
        ))
    }

    /// Extract text from a PDF file, one string per page
    pub fn extract_text(&self, pdf_path: &Path) -> Result<Vec<String>, PdfError> {
        let pdfium = self.bind()?;

        let document = pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| PdfError::OpenFailed(e.to_string()))?;

        let mut pages_text = Vec::new();
        for page in document.pages().iter() {
            let text = page
                .text()
                .map_err(|e| PdfError::PageError(e.to_string()))?;
            pages_text.push(text.all());
        }

        Ok(pages_text)
    }

    /// Get page count for a PDF
    pub fn page_count(&self, pdf_path: &Path) -> Result<usize, PdfError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| PdfError::OpenFailed(e.to_string()))?;
        Ok(document.pages().len() as usize)
    }
}

impl Default for PdfExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn pdfium_name() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "libpdfium.dylib"
    }
    #[cfg(target_os = "linux")]
    {
        "libpdfium.so"
    }
    #[cfg(target_os = "windows")]
    {
        "pdfium.dll"
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        "libpdfium.so"
    }
}
