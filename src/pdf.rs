//! Minimal PDF canvas and flow layout on top of `lopdf`.
//!
//! Text is set either in the standard Helvetica fonts (WinAnsi, nothing
//! embedded, non-Latin-1 characters become `?`) or in a TrueType font that is
//! embedded as a CID-keyed Type0 font with Identity-H encoding. Embedded text
//! is written as 2-byte glyph ids and carries a ToUnicode map so it stays
//! searchable and copyable.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};
use ttf_parser::{name_id, Face, GlyphId};

/// Fonts tried in order when `PDF_FONT` is not set.
pub const FONT_CANDIDATES: &[&str] = &[
    "fonts/NotoSansTC-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansTC-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansCJKtc-Regular.ttf",
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
    "/usr/share/fonts/truetype/arphic-bkai00mp/bkai00mp.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/Library/Fonts/Arial Unicode.ttf",
];

/// Stroke width of faux bold, as a fraction of the font size.
const FAUX_BOLD: f32 = 0.03;

struct FontData {
    face: Face<'static>,
    bytes: &'static [u8],
    name: String,
}

/// A parsed TrueType font. Cloning shares the parsed face.
#[derive(Clone)]
pub struct TrueTypeFont {
    inner: Arc<FontData>,
}

impl fmt::Debug for TrueTypeFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrueTypeFont")
            .field("name", &self.inner.name)
            .field("bytes", &self.inner.bytes.len())
            .finish()
    }
}

impl TrueTypeFont {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
        Self::from_bytes(bytes).with_context(|| format!("unusable font {}", path.display()))
    }

    /// Fonts are loaded once per process and the bytes are kept for its
    /// lifetime, which is what the chart renderer requires as well.
    pub fn from_bytes(bytes: Vec<u8>) -> anyhow::Result<Self> {
        if ttf_parser::fonts_in_collection(&bytes).is_some() {
            bail!("font collections (.ttc) cannot be embedded, extract a single .ttf");
        }
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let face = Face::parse(bytes, 0).map_err(|e| anyhow!("failed to parse font: {e}"))?;
        if face.tables().glyf.is_none() {
            bail!("font has no TrueType outlines (glyf table)");
        }
        let name = face
            .names()
            .into_iter()
            .filter(|name| name.name_id == name_id::POST_SCRIPT_NAME)
            .find_map(|name| name.to_string())
            .map(|name| {
                name.chars()
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                    .collect::<String>()
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "EmbeddedFont".to_string());

        Ok(Self {
            inner: Arc::new(FontData { face, bytes, name }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.inner.bytes
    }

    /// Glyph id for `c`; 0 (`.notdef`) when the font lacks it.
    pub fn glyph_id(&self, c: char) -> u16 {
        self.inner.face.glyph_index(c).map(|glyph| glyph.0).unwrap_or(0)
    }

    /// Scales font units to the 1000-unit glyph space PDF expects.
    fn to_pdf_units(&self, value: i32) -> i64 {
        i64::from(value) * 1000 / i64::from(self.inner.face.units_per_em().max(1))
    }

    fn glyph_advance(&self, glyph: u16) -> i64 {
        let advance = self.inner.face.glyph_hor_advance(GlyphId(glyph)).unwrap_or(0);
        self.to_pdf_units(i32::from(advance))
    }

    fn text_width(&self, text: &str, size: f32) -> f32 {
        let units: i64 = text.chars().map(|c| self.glyph_advance(self.glyph_id(c))).sum();
        units as f32 / 1000.0 * size
    }
}

/// The font every page of a document is set in.
#[derive(Debug, Clone, Default)]
pub enum Typeface {
    /// Helvetica and Helvetica-Bold, WinAnsi encoded.
    #[default]
    Standard,
    Embedded(TrueTypeFont),
}

impl Typeface {
    /// Loads `explicit` when given (failing if it cannot be used), otherwise
    /// the first usable [`FONT_CANDIDATES`] entry, otherwise Helvetica.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            let font = TrueTypeFont::load(path)?;
            tracing::info!(path = %path.display(), font = font.name(), "report font loaded");
            return Ok(Typeface::Embedded(font));
        }

        for candidate in FONT_CANDIDATES {
            let path = Path::new(candidate);
            if !path.is_file() {
                continue;
            }
            match TrueTypeFont::load(path) {
                Ok(font) => {
                    tracing::info!(path = %path.display(), font = font.name(), "report font loaded");
                    return Ok(Typeface::Embedded(font));
                }
                Err(err) => tracing::debug!(path = %path.display(), error = %err, "skipping font candidate"),
            }
        }

        tracing::warn!("no TrueType font found (set PDF_FONT); non-Latin text in reports will render as '?'");
        Ok(Typeface::Standard)
    }

    pub fn truetype(&self) -> Option<&TrueTypeFont> {
        match self {
            Typeface::Standard => None,
            Typeface::Embedded(font) => Some(font),
        }
    }

    /// Advance width of `text` in points.
    pub fn text_width(&self, text: &str, size: f32) -> f32 {
        match self {
            Typeface::Standard => helvetica_width(text, size),
            Typeface::Embedded(font) => font.text_width(text, size),
        }
    }

    /// Greedy word wrap. Explicit newlines always break; words wider than the
    /// line are split by character, so CJK runs without spaces wrap too.
    pub fn wrap(&self, text: &str, max_width: f32, size: f32) -> Vec<String> {
        let mut lines = Vec::new();
        for paragraph in text.split('\n') {
            let mut current = String::new();
            for word in paragraph.split_whitespace() {
                let candidate = if current.is_empty() {
                    word.to_string()
                } else {
                    format!("{current} {word}")
                };
                if self.text_width(&candidate, size) <= max_width {
                    current = candidate;
                    continue;
                }
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                if self.text_width(word, size) <= max_width {
                    current = word.to_string();
                    continue;
                }
                for c in word.chars() {
                    let mut next = current.clone();
                    next.push(c);
                    if self.text_width(&next, size) > max_width && !current.is_empty() {
                        lines.push(std::mem::take(&mut current));
                        current.push(c);
                    } else {
                        current = next;
                    }
                }
            }
            lines.push(current);
        }
        lines
    }

    /// Encodes `text` as a `Tj` operand, recording embedded glyphs in `used`.
    fn encode(&self, text: &str, used: &mut BTreeMap<u16, char>) -> Object {
        match self {
            Typeface::Standard => Object::String(encode_text(text), StringFormat::Literal),
            Typeface::Embedded(font) => {
                let mut bytes = Vec::with_capacity(text.len() * 2);
                for c in text.chars() {
                    let c = if c == '\t' { ' ' } else { c };
                    let glyph = font.glyph_id(c);
                    used.entry(glyph).or_insert(c);
                    bytes.extend_from_slice(&glyph.to_be_bytes());
                }
                Object::String(bytes, StringFormat::Hexadecimal)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

pub const A4: PageSize = PageSize {
    width: 595.28,
    height: 841.89,
};

impl PageSize {
    pub fn landscape(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
        }
    }
}

pub const BLACK: Color = Color::rgb(0, 0, 0);
pub const WHITE: Color = Color::rgb(255, 255, 255);
pub const GREY: Color = Color::rgb(128, 128, 128);
pub const LIGHT_GREY: Color = Color::rgb(211, 211, 211);
pub const WHITESMOKE: Color = Color::rgb(245, 245, 245);
pub const LIGHT_BLUE: Color = Color::rgb(173, 216, 230);
pub const HEADER_BLUE: Color = Color::rgb(0xe1, 0xe7, 0xf0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    Regular,
    Bold,
}

impl Font {
    fn resource_name(self) -> &'static [u8] {
        match self {
            Font::Regular => b"F1",
            Font::Bold => b"F2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
}

fn real(value: f32) -> Object {
    value.into()
}

/// Maps text onto WinAnsi bytes. Latin-1 maps through unchanged.
pub fn encode_text(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c as u32 {
            0x20..=0x7e | 0xa0..=0xff => c as u32 as u8,
            0x09 => b' ',
            _ => b'?',
        })
        .collect()
}

/// Approximate Helvetica advance width in points.
fn helvetica_width(text: &str, size: f32) -> f32 {
    let em: f32 = text
        .chars()
        .map(|c| match c {
            'i' | 'j' | 'l' | '.' | ',' | ':' | ';' | '\'' | '!' | '|' | 'I' => 0.278,
            'f' | 't' | 'r' | ' ' | '(' | ')' | '-' | '/' => 0.333,
            'm' | 'w' | 'M' | 'W' | '@' => 0.833,
            '0'..='9' => 0.556,
            'A'..='Z' => 0.667,
            _ => 0.556,
        })
        .sum();
    em * size
}

#[derive(Debug, Clone)]
pub struct Page {
    typeface: Typeface,
    operations: Vec<Operation>,
    glyphs: BTreeMap<u16, char>,
}

impl Page {
    fn new(typeface: Typeface) -> Self {
        Self {
            typeface,
            operations: Vec::new(),
            glyphs: BTreeMap::new(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.operations.is_empty()
    }

    fn push(&mut self, operator: &str, operands: Vec<Object>) {
        self.operations.push(Operation::new(operator, operands));
    }

    fn set_fill(&mut self, color: Color) {
        self.push("rg", vec![real(color.r), real(color.g), real(color.b)]);
    }

    fn set_stroke(&mut self, color: Color, width: f32) {
        self.push("RG", vec![real(color.r), real(color.g), real(color.b)]);
        self.push("w", vec![real(width)]);
    }

    pub fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color) {
        self.push("q", vec![]);
        self.set_fill(color);
        self.push("re", vec![real(x), real(y), real(width), real(height)]);
        self.push("f", vec![]);
        self.push("Q", vec![]);
    }

    pub fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32, line: f32, color: Color) {
        self.push("q", vec![]);
        self.set_stroke(color, line);
        self.push("re", vec![real(x), real(y), real(width), real(height)]);
        self.push("S", vec![]);
        self.push("Q", vec![]);
    }

    /// Sets one line of text with its baseline starting at (`x`, `y`).
    pub fn text(&mut self, x: f32, y: f32, font: Font, size: f32, color: Color, text: &str) {
        let operand = self.typeface.encode(text, &mut self.glyphs);
        let faux_bold = font == Font::Bold && matches!(self.typeface, Typeface::Embedded(_));

        self.push("q", vec![]);
        self.set_fill(color);
        if faux_bold {
            // fill then stroke the outlines
            self.set_stroke(color, size * FAUX_BOLD);
            self.push("Tr", vec![2.into()]);
        }
        self.push("BT", vec![]);
        self.push("Tf", vec![Object::Name(font.resource_name().to_vec()), real(size)]);
        self.push("Td", vec![real(x), real(y)]);
        self.push("Tj", vec![operand]);
        self.push("ET", vec![]);
        self.push("Q", vec![]);
    }
}

#[derive(Debug, Clone)]
pub struct PdfDocument {
    pub size: PageSize,
    typeface: Typeface,
    pages: Vec<Page>,
}

impl PdfDocument {
    pub fn new(size: PageSize, typeface: Typeface) -> Self {
        Self {
            size,
            pages: vec![Page::new(typeface.clone())],
            typeface,
        }
    }

    pub fn add_page(&mut self) -> &mut Page {
        self.pages.push(Page::new(self.typeface.clone()));
        self.current_page()
    }

    pub fn current_page(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.pages.push(Page::new(self.typeface.clone()));
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    /// Adds the font objects and returns the ids for the regular and bold
    /// resource names.
    fn add_fonts(&self, doc: &mut Document) -> anyhow::Result<(ObjectId, ObjectId)> {
        match &self.typeface {
            Typeface::Standard => {
                let regular = doc.add_object(dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => "Helvetica",
                    "Encoding" => "WinAnsiEncoding",
                });
                let bold = doc.add_object(dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => "Helvetica-Bold",
                    "Encoding" => "WinAnsiEncoding",
                });
                Ok((regular, bold))
            }
            Typeface::Embedded(font) => {
                let mut glyphs = BTreeMap::new();
                for page in &self.pages {
                    for (glyph, c) in &page.glyphs {
                        glyphs.entry(*glyph).or_insert(*c);
                    }
                }
                let id = embed_font(doc, font, &glyphs)?;
                Ok((id, id))
            }
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let (regular_id, bold_id) = self.add_fonts(&mut doc)?;
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => regular_id,
                "F2" => bold_id,
            },
        });

        let mut kids = Vec::with_capacity(self.pages.len());
        for page in &self.pages {
            let content = Content {
                operations: page.operations.clone(),
            };
            let encoded = content.encode().context("failed to encode page content")?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "MediaBox" => vec![0.into(), 0.into(), real(self.size.width), real(self.size.height)],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).context("failed to serialize PDF")?;
        Ok(bytes)
    }

    /// Writes the document to `path`, replacing any existing file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Embeds the whole font program as a Type0 font over a CIDFontType2
/// descendant. Widths and ToUnicode entries cover the glyphs in `used`.
fn embed_font(doc: &mut Document, font: &TrueTypeFont, used: &BTreeMap<u16, char>) -> anyhow::Result<ObjectId> {
    let face = &font.inner.face;
    let units = |value: i16| font.to_pdf_units(i32::from(value));

    let mut program = Stream::new(
        dictionary! { "Length1" => font.bytes().len() as i64 },
        font.bytes().to_vec(),
    );
    program.compress().context("failed to compress font program")?;
    let program_id = doc.add_object(program);

    let bbox = face.global_bounding_box();
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => font.name(),
        "Flags" => 32,
        "FontBBox" => [bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max]
            .into_iter()
            .map(|value| Object::Integer(units(value)))
            .collect::<Vec<Object>>(),
        "ItalicAngle" => 0,
        "Ascent" => units(face.ascender()),
        "Descent" => units(face.descender()),
        "CapHeight" => units(face.capital_height().unwrap_or_else(|| face.ascender())),
        "StemV" => 80,
        "FontFile2" => program_id,
    });

    let widths: Vec<Object> = used
        .keys()
        .flat_map(|glyph| {
            [
                Object::Integer(i64::from(*glyph)),
                Object::Array(vec![Object::Integer(font.glyph_advance(*glyph))]),
            ]
        })
        .collect();
    let descendant_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => font.name(),
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => 1000,
        "W" => widths,
        "CIDToGIDMap" => "Identity",
    });

    let cmap = Stream::new(dictionary! {}, to_unicode_cmap(used).into_bytes());
    let cmap_id = doc.add_object(cmap);

    Ok(doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => font.name(),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![Object::Reference(descendant_id)],
        "ToUnicode" => cmap_id,
    }))
}

/// ToUnicode CMap mapping each used glyph id back to its character.
fn to_unicode_cmap(used: &BTreeMap<u16, char>) -> String {
    let mut cmap = String::new();
    let _ = writeln!(cmap, "/CIDInit /ProcSet findresource begin");
    let _ = writeln!(cmap, "12 dict begin");
    let _ = writeln!(cmap, "begincmap");
    let _ = writeln!(cmap, "/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def");
    let _ = writeln!(cmap, "/CMapName /Adobe-Identity-UCS def");
    let _ = writeln!(cmap, "/CMapType 2 def");
    let _ = writeln!(cmap, "1 begincodespacerange");
    let _ = writeln!(cmap, "<0000> <FFFF>");
    let _ = writeln!(cmap, "endcodespacerange");

    let mapped: Vec<(u16, char)> = used
        .iter()
        .filter(|(glyph, _)| **glyph != 0)
        .map(|(glyph, c)| (*glyph, *c))
        .collect();
    // at most 100 entries per block
    for block in mapped.chunks(100) {
        let _ = writeln!(cmap, "{} beginbfchar", block.len());
        for (glyph, c) in block {
            let mut units = [0u16; 2];
            let hex: String = c.encode_utf16(&mut units).iter().map(|unit| format!("{unit:04X}")).collect();
            let _ = writeln!(cmap, "<{glyph:04X}> <{hex}>");
        }
        let _ = writeln!(cmap, "endbfchar");
    }

    let _ = writeln!(cmap, "endcmap");
    let _ = writeln!(cmap, "CMapName currentdict /CMap defineresource pop");
    let _ = writeln!(cmap, "end");
    let _ = write!(cmap, "end");
    cmap
}

/// Header and body styling for [`Flow::table`].
#[derive(Debug, Clone)]
pub struct TableStyle {
    pub header_background: Color,
    pub header_text: Color,
    pub row_backgrounds: Vec<Color>,
    pub grid: Color,
    pub grid_width: f32,
    pub font_size: f32,
    pub padding_x: f32,
    pub padding_top: f32,
    pub header_padding_bottom: f32,
    pub padding_bottom: f32,
    pub align: Align,
    pub column_widths: Option<Vec<f32>>,
}

impl Default for TableStyle {
    fn default() -> Self {
        Self {
            header_background: HEADER_BLUE,
            header_text: BLACK,
            row_backgrounds: vec![WHITESMOKE, LIGHT_GREY],
            grid: GREY,
            grid_width: 0.25,
            font_size: 10.0,
            padding_x: 4.0,
            padding_top: 6.0,
            header_padding_bottom: 10.0,
            padding_bottom: 4.0,
            align: Align::Left,
            column_widths: None,
        }
    }
}

/// A text table with a header row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Top-to-bottom layout cursor over a [`PdfDocument`].
pub struct Flow {
    doc: PdfDocument,
    margin: f32,
    cursor: f32,
}

impl Flow {
    pub fn new(size: PageSize, margin: f32, typeface: &Typeface) -> Self {
        Self {
            doc: PdfDocument::new(size, typeface.clone()),
            margin,
            cursor: size.height - margin,
        }
    }

    pub fn width(&self) -> f32 {
        self.doc.size.width - 2.0 * self.margin
    }

    fn typeface(&self) -> &Typeface {
        &self.doc.typeface
    }

    fn remaining(&self) -> f32 {
        self.cursor - self.margin
    }

    /// Starts a new page unless the current one is still blank.
    pub fn page_break(&mut self) {
        if !self.doc.current_page().is_blank() {
            self.doc.add_page();
        }
        self.cursor = self.doc.size.height - self.margin;
    }

    fn ensure(&mut self, height: f32) {
        if height > self.remaining() {
            self.page_break();
        }
    }

    pub fn spacer(&mut self, height: f32) {
        self.cursor -= height;
    }

    pub fn line(&mut self, text: &str, font: Font, size: f32) {
        let leading = size * 1.25;
        self.ensure(leading);
        let (x, y) = (self.margin, self.cursor - size);
        self.doc.current_page().text(x, y, font, size, BLACK, text);
        self.cursor -= leading;
    }

    pub fn paragraph(&mut self, text: &str, font: Font, size: f32) {
        for line in self.typeface().wrap(text, self.width(), size) {
            self.line(&line, font, size);
        }
    }

    pub fn table(&mut self, table: &Table, style: &TableStyle) {
        let columns = table
            .headers
            .len()
            .max(table.rows.iter().map(Vec::len).max().unwrap_or(0));
        if columns == 0 {
            return;
        }
        let widths = match &style.column_widths {
            Some(widths) if widths.len() == columns => widths.clone(),
            _ => vec![self.width() / columns as f32; columns],
        };

        self.table_row(&table.headers, &widths, style, true, None);
        for (index, row) in table.rows.iter().enumerate() {
            let background = if style.row_backgrounds.is_empty() {
                None
            } else {
                Some(style.row_backgrounds[index % style.row_backgrounds.len()])
            };
            let height = self.row_height(row, &widths, style, false);
            if height > self.remaining() {
                self.page_break();
                self.table_row(&table.headers, &widths, style, true, None);
            }
            self.table_row(row, &widths, style, false, background);
        }
    }

    fn cell_lines(&self, cells: &[String], widths: &[f32], style: &TableStyle) -> Vec<Vec<String>> {
        widths
            .iter()
            .enumerate()
            .map(|(column, width)| {
                let text = cells.get(column).map(String::as_str).unwrap_or_default();
                self.typeface().wrap(text, width - 2.0 * style.padding_x, style.font_size)
            })
            .collect()
    }

    fn row_height(&self, cells: &[String], widths: &[f32], style: &TableStyle, header: bool) -> f32 {
        let lines = self
            .cell_lines(cells, widths, style)
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(1)
            .max(1);
        let bottom = if header {
            style.header_padding_bottom
        } else {
            style.padding_bottom
        };
        lines as f32 * style.font_size * 1.2 + style.padding_top + bottom
    }

    fn table_row(
        &mut self,
        cells: &[String],
        widths: &[f32],
        style: &TableStyle,
        header: bool,
        background: Option<Color>,
    ) {
        let height = self.row_height(cells, widths, style, header);
        self.ensure(height);
        let lines = self.cell_lines(cells, widths, style);
        let top = self.cursor;
        let bottom = top - height;
        let (font, color, fill) = if header {
            (Font::Bold, style.header_text, Some(style.header_background))
        } else {
            (Font::Regular, BLACK, background)
        };

        let margin = self.margin;
        let typeface = self.doc.typeface.clone();
        let page = self.doc.current_page();
        let mut x = margin;
        for (column, width) in widths.iter().enumerate() {
            if let Some(fill) = fill {
                page.fill_rect(x, bottom, *width, height, fill);
            }
            page.stroke_rect(x, bottom, *width, height, style.grid_width, style.grid);
            let mut baseline = top - style.padding_top - style.font_size;
            for line in &lines[column] {
                let offset = match style.align {
                    Align::Left => style.padding_x,
                    Align::Center => ((width - typeface.text_width(line, style.font_size)) / 2.0).max(0.0),
                };
                page.text(x + offset, baseline, font, style.font_size, color, line);
                baseline -= style.font_size * 1.2;
            }
            x += width;
        }
        self.cursor = bottom;
    }

    /// Drops a trailing blank page left behind by a final page break.
    pub fn finish(mut self) -> PdfDocument {
        while self.doc.pages.len() > 1 && self.doc.pages.last().is_some_and(Page::is_blank) {
            self.doc.pages.pop();
        }
        self.doc
    }
}


#[cfg(test)]
mod tests {
    use super::testing::system_font;
    use super::*;

    fn sample_table(rows: usize) -> Table {
        Table {
            headers: vec!["Name".to_string(), "Score".to_string()],
            rows: (0..rows)
                .map(|i| vec![format!("Student {i}"), format!("{}", 40 + i)])
                .collect(),
        }
    }

    fn text_operands(bytes: &[u8]) -> Vec<Vec<u8>> {
        let doc = Document::load_mem(bytes).unwrap();
        doc.get_pages()
            .values()
            .flat_map(|id| Content::decode(&doc.get_page_content(*id).unwrap()).unwrap().operations)
            .filter(|operation| operation.operator == "Tj")
            .map(|operation| operation.operands[0].as_str().unwrap().to_vec())
            .collect()
    }

    #[test]
    fn encodes_latin1_and_replaces_the_rest() {
        assert_eq!(encode_text("Café"), b"Caf\xe9".to_vec());
        assert_eq!(encode_text("姓名 A"), b"?? A".to_vec());
    }

    #[test]
    fn wrap_respects_width_and_newlines() {
        let typeface = Typeface::Standard;
        let lines = typeface.wrap("one two three four five six", 60.0, 10.0);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(typeface.text_width(line, 10.0) <= 60.0, "{line}");
        }
        assert_eq!(typeface.wrap("a\nb", 500.0, 10.0), vec!["a", "b"]);
        assert_eq!(typeface.wrap("", 500.0, 10.0), vec![""]);
    }

    #[test]
    fn long_words_are_split() {
        let word = "x".repeat(200);
        let lines = Typeface::Standard.wrap(&word, 50.0, 10.0);
        assert!(lines.len() > 1);
        assert_eq!(lines.concat(), word);
    }

    #[test]
    fn long_tables_paginate() {
        let mut flow = Flow::new(A4, 36.0, &Typeface::Standard);
        flow.table(&sample_table(200), &TableStyle::default());
        let doc = flow.finish();
        assert!(doc.pages.len() > 1);

        let bytes = doc.to_bytes().unwrap();
        let parsed = Document::load_mem(&bytes).unwrap();
        assert_eq!(parsed.get_pages().len(), doc.pages.len());
    }

    #[test]
    fn page_break_on_blank_page_is_a_no_op() {
        let mut flow = Flow::new(A4, 36.0, &Typeface::Standard);
        flow.page_break();
        flow.line("hello", Font::Regular, 12.0);
        flow.page_break();
        flow.page_break();
        flow.line("world", Font::Regular, 12.0);
        flow.page_break();
        assert_eq!(flow.finish().pages.len(), 2);
    }

    #[test]
    fn rendering_is_deterministic() {
        let render = || {
            let mut flow = Flow::new(A4.landscape(), 36.0, &Typeface::Standard);
            flow.line("Report", Font::Bold, 16.0);
            flow.table(&sample_table(5), &TableStyle::default());
            flow.finish().to_bytes().unwrap()
        };
        assert_eq!(render(), render());
    }

    #[test]
    fn cmap_maps_glyphs_back_to_text() {
        let used = BTreeMap::from([(0, '\u{fffd}'), (36, 'A'), (1234, '姓')]);
        let cmap = to_unicode_cmap(&used);
        assert!(cmap.contains("2 beginbfchar"));
        assert!(cmap.contains("<0024> <0041>"));
        assert!(cmap.contains("<04D2> <59D3>"));
        assert!(!cmap.contains("<0000> <FFFD>"));
    }

    #[test]
    fn missing_font_file_is_an_error() {
        assert!(Typeface::discover(Some(Path::new("/nonexistent/font.ttf"))).is_err());
        assert!(TrueTypeFont::from_bytes(b"not a font".to_vec()).is_err());
    }

    #[test]
    fn embedded_font_writes_glyph_ids_not_placeholders() {
        let Some(font) = system_font() else {
            eprintln!("no TrueType font installed, skipping");
            return;
        };
        let typeface = Typeface::Embedded(font.clone());
        let mut flow = Flow::new(A4, 36.0, &typeface);
        flow.line("Aiko 姓名", Font::Regular, 12.0);
        flow.table(
            &Table {
                headers: vec!["姓名".to_string(), "聽力成績".to_string()],
                rows: vec![vec!["王小明".to_string(), "60".to_string()]],
            },
            &TableStyle::default(),
        );
        let bytes = flow.finish().to_bytes().unwrap();

        let operands = text_operands(&bytes);
        assert_eq!(operands[0].len(), "Aiko 姓名".chars().count() * 2);
        assert_eq!(&operands[0][..2], &font.glyph_id('A').to_be_bytes());
        assert_eq!(operands[1].len(), 4);
        assert_eq!(operands[2].len(), 8);
        assert_eq!(&operands[1][..2], &font.glyph_id('姓').to_be_bytes());

        let doc = Document::load_mem(&bytes).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let fonts = doc.get_page_fonts(page_id).unwrap();
        let type0 = fonts.get(b"F1".as_slice()).unwrap();
        assert_eq!(type0.get(b"Subtype").unwrap().as_name_str().unwrap(), "Type0");
        assert_eq!(type0.get(b"Encoding").unwrap().as_name_str().unwrap(), "Identity-H");
        assert!(type0.get(b"ToUnicode").is_ok());
    }

    #[test]
    fn embedded_widths_drive_wrapping() {
        let Some(font) = system_font() else {
            eprintln!("no TrueType font installed, skipping");
            return;
        };
        let typeface = Typeface::Embedded(font);
        let text = "Practise shadowing every morning and keep a vocabulary notebook.";
        for line in typeface.wrap(text, 120.0, 12.0) {
            assert!(typeface.text_width(&line, 12.0) <= 120.0, "{line}");
        }
        assert!(typeface.text_width("WWW", 12.0) > typeface.text_width("iii", 12.0));
    }
}
