//! Fixed-layout, paginated PDF rendering of a shipment receipt.

use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};

/// US letter, portrait.
pub const PAGE_WIDTH: f32 = 215.9;
pub const PAGE_HEIGHT: f32 = 279.4;
/// Half an inch on every side.
pub const MARGIN: f32 = 12.7;

const LINE_HEIGHT: f32 = 7.0;
const VALUE_COLUMN: f32 = 70.0;
const WRAP_AT: usize = 60;

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("could not render receipt: {0}")]
    Render(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptLine {
    Title(String),
    Heading(String),
    Field(String, String),
    Gap,
}

impl ReceiptLine {
    pub fn field(label: impl Into<String>, value: impl ToString) -> Self {
        Self::Field(label.into(), value.to_string())
    }

    fn font_size(&self) -> f32 {
        match self {
            Self::Title(_) => 18.0,
            Self::Heading(_) => 13.0,
            Self::Field(..) | Self::Gap => 11.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placed {
    pub line: ReceiptLine,
    /// Baseline, measured from the bottom edge.
    pub y: f32,
}

/// Splits `value` into chunks of at most `width` characters, preferring spaces.
pub fn wrap(value: &str, width: usize) -> Vec<String> {
    let mut lines = vec![];
    let mut current = String::new();

    for word in value.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let head: String = word.chars().take(width).collect();
            word = word.chars().skip(width).collect();
            lines.push(head);
        }

        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if needed > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }

    lines
}

/// Places every line top to bottom, starting a new page when the bottom
/// margin is reached. Long field values continue on following rows.
pub fn layout(lines: &[ReceiptLine]) -> Vec<Vec<Placed>> {
    let top = PAGE_HEIGHT - MARGIN;
    let mut pages = vec![vec![]];
    let mut y = top;

    let mut rows = vec![];
    for line in lines {
        match line {
            ReceiptLine::Field(label, value) => {
                for (i, chunk) in wrap(value, WRAP_AT).into_iter().enumerate() {
                    let label = if i == 0 { label.clone() } else { String::new() };
                    rows.push(ReceiptLine::Field(label, chunk));
                }
            }
            other => rows.push(other.clone()),
        }
    }

    for line in rows {
        let advance = match line {
            ReceiptLine::Title(_) => LINE_HEIGHT * 2.0,
            ReceiptLine::Heading(_) => LINE_HEIGHT * 1.5,
            ReceiptLine::Field(..) | ReceiptLine::Gap => LINE_HEIGHT,
        };

        if y - advance < MARGIN {
            pages.push(vec![]);
            y = top;
        }
        y -= advance;

        if line != ReceiptLine::Gap {
            if let Some(page) = pages.last_mut() {
                page.push(Placed { line, y });
            }
        }
    }

    pages
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

fn draw(layer: &PdfLayerReference, fonts: &Fonts, placed: &Placed) {
    let size = placed.line.font_size();
    match &placed.line {
        ReceiptLine::Title(text) | ReceiptLine::Heading(text) => {
            layer.use_text(text.as_str(), size, Mm(MARGIN), Mm(placed.y), &fonts.bold);
        }
        ReceiptLine::Field(label, value) => {
            if !label.is_empty() {
                layer.use_text(label.as_str(), size, Mm(MARGIN), Mm(placed.y), &fonts.bold);
            }
            layer.use_text(value.as_str(), size, Mm(VALUE_COLUMN), Mm(placed.y), &fonts.regular);
        }
        ReceiptLine::Gap => {}
    }
}

fn render_error(err: impl std::fmt::Display) -> ReceiptError {
    ReceiptError::Render(err.to_string())
}

pub fn render(title: &str, lines: &[ReceiptLine]) -> Result<Vec<u8>, ReceiptError> {
    let (document, first_page, first_layer) =
        PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "receipt");

    let fonts = Fonts {
        regular: document
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(render_error)?,
        bold: document
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(render_error)?,
    };

    for (index, page) in layout(lines).iter().enumerate() {
        let layer = if index == 0 {
            document.get_page(first_page).get_layer(first_layer)
        } else {
            let (page, layer) = document.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "receipt");
            document.get_page(page).get_layer(layer)
        };

        for placed in page {
            draw(&layer, &fonts, placed);
        }
    }

    document.save_to_bytes().map_err(render_error)
}
