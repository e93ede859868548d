//! Converter registry: the fixed table of supported conversion pairs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ToolConfig;
use crate::converter::{Converter, ImageToPdfConverter, OfficeConverter, PdfToImageConverter};
use crate::error::NotSupported;
use crate::format::{ConversionPair, Format};

/// The closed set of converter capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConverterKind {
    /// LibreOffice: documents and spreadsheets to PDF, PDF to DOCX.
    Office,
    /// Raster image to PDF.
    ImageToPdf,
    /// PDF pages to raster images.
    PdfToImage,
}

/// Every supported (from, to) pair and the capability that handles it.
pub const SUPPORTED_CONVERSIONS: [(Format, Format, ConverterKind); 10] = [
    (Format::Pdf, Format::Docx, ConverterKind::Office),
    (Format::Docx, Format::Pdf, ConverterKind::Office),
    (Format::Doc, Format::Pdf, ConverterKind::Office),
    (Format::Xlsx, Format::Pdf, ConverterKind::Office),
    (Format::Xls, Format::Pdf, ConverterKind::Office),
    (Format::Jpg, Format::Pdf, ConverterKind::ImageToPdf),
    (Format::Jpeg, Format::Pdf, ConverterKind::ImageToPdf),
    (Format::Png, Format::Pdf, ConverterKind::ImageToPdf),
    (Format::Pdf, Format::Png, ConverterKind::PdfToImage),
    (Format::Pdf, Format::Jpg, ConverterKind::PdfToImage),
];

/// Maps conversion pairs to converter instances. Built once at boot.
pub struct Registry {
    routes: HashMap<ConversionPair, ConverterKind>,
    converters: HashMap<ConverterKind, Arc<dyn Converter>>,
}

impl Registry {
    pub fn new(tools: &ToolConfig) -> Self {
        let routes = SUPPORTED_CONVERSIONS
            .iter()
            .map(|&(from, to, kind)| (ConversionPair::new(from, to), kind))
            .collect();

        let mut converters: HashMap<ConverterKind, Arc<dyn Converter>> = HashMap::new();
        converters.insert(
            ConverterKind::Office,
            Arc::new(OfficeConverter::new(tools.soffice.clone())),
        );
        converters.insert(ConverterKind::ImageToPdf, Arc::new(ImageToPdfConverter::new()));
        converters.insert(
            ConverterKind::PdfToImage,
            Arc::new(PdfToImageConverter::new(tools.pdftoppm.clone(), tools.pdf_dpi)),
        );

        Self { routes, converters }
    }

    /// Replaces the implementation behind `kind`.
    pub fn with_converter(mut self, kind: ConverterKind, converter: Arc<dyn Converter>) -> Self {
        self.converters.insert(kind, converter);
        self
    }

    pub fn kind_of(&self, pair: ConversionPair) -> Result<ConverterKind, NotSupported> {
        self.routes.get(&pair).copied().ok_or(NotSupported(pair))
    }

    /// Looks up the converter for `pair`. Performs no I/O.
    pub fn resolve(&self, pair: ConversionPair) -> Result<Arc<dyn Converter>, NotSupported> {
        let kind = self.kind_of(pair)?;
        self.converters.get(&kind).cloned().ok_or(NotSupported(pair))
    }

    pub fn supports(&self, pair: ConversionPair) -> bool {
        self.routes.contains_key(&pair)
    }

    /// Supported pairs in table order.
    pub fn pairs(&self) -> impl Iterator<Item = ConversionPair> + '_ {
        SUPPORTED_CONVERSIONS
            .iter()
            .map(|&(from, to, _)| ConversionPair::new(from, to))
            .filter(|pair| self.routes.contains_key(pair))
    }
}
