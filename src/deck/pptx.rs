//! Minimal OOXML presentation package writer.
//!
//! Emits just the parts a conforming reader requires: content types, the
//! package and per-part relationships, one blank master/layout/theme
//! chain, and one slide part per deck slide. Shape XML is assembled as
//! strings; user-supplied text goes through [`quick_xml::escape::escape`].

use std::io::Write as _;
use std::path::Path;

use quick_xml::escape::escape;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::EngineError;
use crate::layout::Align;

use super::{Shape, SlideShapes, TableShape, TextShape, DEFAULT_FONT_NAME};

pub const EMU_PER_INCH: i64 = 914_400;

const NS_A: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
const NS_P: &str = "http://schemas.openxmlformats.org/presentationml/2006/main";
const NS_R: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

/// Serialise `slides` into a presentation package at `path`.
pub(crate) fn write_package(
    width_in: f64,
    height_in: f64,
    slides: &[SlideShapes],
    path: &Path,
) -> Result<(), EngineError> {
    let file = std::fs::File::create(path).map_err(|e| EngineError::OutputWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let put = |name: &str, body: &[u8], zip: &mut ZipWriter<std::fs::File>| {
        zip.start_file(name, options)
            .and_then(|()| zip.write_all(body).map_err(Into::into))
            .map_err(|e| EngineError::DeckBuild(format!("writing {name}: {e}")))
    };

    put("[Content_Types].xml", content_types(slides.len()).as_bytes(), &mut zip)?;
    put("_rels/.rels", ROOT_RELS.as_bytes(), &mut zip)?;
    put(
        "ppt/presentation.xml",
        presentation_xml(width_in, height_in, slides.len()).as_bytes(),
        &mut zip,
    )?;
    put(
        "ppt/_rels/presentation.xml.rels",
        presentation_rels(slides.len()).as_bytes(),
        &mut zip,
    )?;
    put("ppt/slideMasters/slideMaster1.xml", master_xml().as_bytes(), &mut zip)?;
    put(
        "ppt/slideMasters/_rels/slideMaster1.xml.rels",
        MASTER_RELS.as_bytes(),
        &mut zip,
    )?;
    put("ppt/slideLayouts/slideLayout1.xml", layout_xml().as_bytes(), &mut zip)?;
    put(
        "ppt/slideLayouts/_rels/slideLayout1.xml.rels",
        LAYOUT_RELS.as_bytes(),
        &mut zip,
    )?;
    put("ppt/theme/theme1.xml", theme_xml().as_bytes(), &mut zip)?;

    let mut media_seq = 0usize;
    for (idx, slide) in slides.iter().enumerate() {
        let parts = render_slide(slide, &mut media_seq);
        let n = idx + 1;
        put(&format!("ppt/slides/slide{n}.xml"), parts.xml.as_bytes(), &mut zip)?;
        put(
            &format!("ppt/slides/_rels/slide{n}.xml.rels"),
            parts.rels.as_bytes(),
            &mut zip,
        )?;
        for (name, bytes) in parts.media {
            put(&format!("ppt/media/{name}"), bytes, &mut zip)?;
        }
    }

    zip.finish()
        .map_err(|e| EngineError::DeckBuild(format!("finalising package: {e}")))?;
    Ok(())
}

// ── Package-level parts ──────────────────────────────────────────────────

fn content_types(slide_count: usize) -> String {
    let mut xml = String::from(XML_DECL);
    xml.push_str(
        r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
    );
    xml.push_str(r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#);
    xml.push_str(r#"<Default Extension="xml" ContentType="application/xml"/>"#);
    xml.push_str(r#"<Default Extension="png" ContentType="image/png"/>"#);
    xml.push_str(r#"<Default Extension="jpeg" ContentType="image/jpeg"/>"#);
    xml.push_str(r#"<Override PartName="/ppt/presentation.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.presentation.main+xml"/>"#);
    xml.push_str(r#"<Override PartName="/ppt/slideMasters/slideMaster1.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slideMaster+xml"/>"#);
    xml.push_str(r#"<Override PartName="/ppt/slideLayouts/slideLayout1.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slideLayout+xml"/>"#);
    xml.push_str(r#"<Override PartName="/ppt/theme/theme1.xml" ContentType="application/vnd.openxmlformats-officedocument.theme+xml"/>"#);
    for n in 1..=slide_count {
        xml.push_str(&format!(
            r#"<Override PartName="/ppt/slides/slide{n}.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slide+xml"/>"#,
        ));
    }
    xml.push_str("</Types>");
    xml
}

const ROOT_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="ppt/presentation.xml"/>"#,
    r#"</Relationships>"#,
);

fn presentation_xml(width_in: f64, height_in: f64, slide_count: usize) -> String {
    let cx = super::to_emu(width_in);
    let cy = super::to_emu(height_in);
    let mut xml = String::from(XML_DECL);
    xml.push_str(&format!(
        r#"<p:presentation xmlns:a="{NS_A}" xmlns:r="{NS_R}" xmlns:p="{NS_P}">"#
    ));
    xml.push_str(r#"<p:sldMasterIdLst><p:sldMasterId id="2147483648" r:id="rId1"/></p:sldMasterIdLst>"#);
    xml.push_str("<p:sldIdLst>");
    for n in 0..slide_count {
        // Slide relationships start after the master at rId2.
        xml.push_str(&format!(
            r#"<p:sldId id="{}" r:id="rId{}"/>"#,
            256 + n,
            n + 2
        ));
    }
    xml.push_str("</p:sldIdLst>");
    xml.push_str(&format!(r#"<p:sldSz cx="{cx}" cy="{cy}"/>"#));
    xml.push_str(r#"<p:notesSz cx="6858000" cy="9144000"/>"#);
    xml.push_str("</p:presentation>");
    xml
}

fn presentation_rels(slide_count: usize) -> String {
    let mut xml = String::from(XML_DECL);
    xml.push_str(
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    xml.push_str(r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideMaster" Target="slideMasters/slideMaster1.xml"/>"#);
    for n in 1..=slide_count {
        xml.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide" Target="slides/slide{n}.xml"/>"#,
            n + 1,
        ));
    }
    xml.push_str("</Relationships>");
    xml
}

// ── Master, layout, theme ────────────────────────────────────────────────

const EMPTY_SP_TREE: &str = concat!(
    "<p:spTree>",
    r#"<p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr>"#,
    r#"<p:grpSpPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="0" cy="0"/><a:chOff x="0" y="0"/><a:chExt cx="0" cy="0"/></a:xfrm></p:grpSpPr>"#,
    "</p:spTree>",
);

fn master_xml() -> String {
    format!(
        concat!(
            r#"{decl}<p:sldMaster xmlns:a="{a}" xmlns:r="{r}" xmlns:p="{p}">"#,
            "<p:cSld>{tree}</p:cSld>",
            r#"<p:clrMap bg1="lt1" tx1="dk1" bg2="lt2" tx2="dk2" accent1="accent1" accent2="accent2" accent3="accent3" accent4="accent4" accent5="accent5" accent6="accent6" hlink="hlink" folHlink="folHlink"/>"#,
            r#"<p:sldLayoutIdLst><p:sldLayoutId id="2147483649" r:id="rId1"/></p:sldLayoutIdLst>"#,
            "</p:sldMaster>",
        ),
        decl = XML_DECL,
        a = NS_A,
        r = NS_R,
        p = NS_P,
        tree = EMPTY_SP_TREE,
    )
}

const MASTER_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideLayout" Target="../slideLayouts/slideLayout1.xml"/>"#,
    r#"<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/theme" Target="../theme/theme1.xml"/>"#,
    r#"</Relationships>"#,
);

fn layout_xml() -> String {
    format!(
        concat!(
            r#"{decl}<p:sldLayout xmlns:a="{a}" xmlns:r="{r}" xmlns:p="{p}" type="blank" preserve="1">"#,
            r#"<p:cSld name="Blank">{tree}</p:cSld>"#,
            "<p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr>",
            "</p:sldLayout>",
        ),
        decl = XML_DECL,
        a = NS_A,
        r = NS_R,
        p = NS_P,
        tree = EMPTY_SP_TREE,
    )
}

const LAYOUT_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideMaster" Target="../slideMasters/slideMaster1.xml"/>"#,
    r#"</Relationships>"#,
);

fn theme_xml() -> String {
    let fills = r#"<a:solidFill><a:schemeClr val="phClr"/></a:solidFill>"#.repeat(3);
    let lines = r#"<a:ln><a:solidFill><a:schemeClr val="phClr"/></a:solidFill></a:ln>"#.repeat(3);
    let effects = "<a:effectStyle><a:effectLst/></a:effectStyle>".repeat(3);
    format!(
        concat!(
            r#"{decl}<a:theme xmlns:a="{a}" name="Office Theme"><a:themeElements>"#,
            r#"<a:clrScheme name="Office">"#,
            r#"<a:dk1><a:sysClr val="windowText" lastClr="000000"/></a:dk1>"#,
            r#"<a:lt1><a:sysClr val="window" lastClr="FFFFFF"/></a:lt1>"#,
            r#"<a:dk2><a:srgbClr val="44546A"/></a:dk2>"#,
            r#"<a:lt2><a:srgbClr val="E7E6E6"/></a:lt2>"#,
            r#"<a:accent1><a:srgbClr val="4472C4"/></a:accent1>"#,
            r#"<a:accent2><a:srgbClr val="ED7D31"/></a:accent2>"#,
            r#"<a:accent3><a:srgbClr val="A5A5A5"/></a:accent3>"#,
            r#"<a:accent4><a:srgbClr val="FFC000"/></a:accent4>"#,
            r#"<a:accent5><a:srgbClr val="5B9BD5"/></a:accent5>"#,
            r#"<a:accent6><a:srgbClr val="70AD47"/></a:accent6>"#,
            r#"<a:hlink><a:srgbClr val="0563C1"/></a:hlink>"#,
            r#"<a:folHlink><a:srgbClr val="954F72"/></a:folHlink>"#,
            "</a:clrScheme>",
            r#"<a:fontScheme name="Office">"#,
            r#"<a:majorFont><a:latin typeface="Calibri Light"/><a:ea typeface=""/><a:cs typeface=""/></a:majorFont>"#,
            r#"<a:minorFont><a:latin typeface="Calibri"/><a:ea typeface=""/><a:cs typeface=""/></a:minorFont>"#,
            "</a:fontScheme>",
            r#"<a:fmtScheme name="Office">"#,
            "<a:fillStyleLst>{fills}</a:fillStyleLst>",
            "<a:lnStyleLst>{lines}</a:lnStyleLst>",
            "<a:effectStyleLst>{effects}</a:effectStyleLst>",
            "<a:bgFillStyleLst>{fills}</a:bgFillStyleLst>",
            "</a:fmtScheme>",
            "</a:themeElements></a:theme>",
        ),
        decl = XML_DECL,
        a = NS_A,
        fills = fills,
        lines = lines,
        effects = effects,
    )
}

// ── Slide parts ──────────────────────────────────────────────────────────

struct SlideParts<'a> {
    xml: String,
    rels: String,
    /// Archive file name under `ppt/media/` and the raw bytes.
    media: Vec<(String, &'a [u8])>,
}

fn render_slide<'a>(slide: &'a SlideShapes, media_seq: &mut usize) -> SlideParts<'a> {
    let mut body = String::new();
    let mut rels = String::from(XML_DECL);
    rels.push_str(
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    rels.push_str(r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideLayout" Target="../slideLayouts/slideLayout1.xml"/>"#);
    let mut media = Vec::new();
    let mut next_rid = 2usize;

    for (i, shape) in slide.shapes.iter().enumerate() {
        // Shape id 1 is the group shape.
        let id = i + 2;
        match shape {
            Shape::Picture {
                bytes,
                format,
                rect,
            } => {
                *media_seq += 1;
                let name = format!("image{media_seq}.{format}");
                let rid = format!("rId{next_rid}");
                next_rid += 1;
                rels.push_str(&format!(
                    r#"<Relationship Id="{rid}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="../media/{name}"/>"#,
                ));
                media.push((name, bytes.as_slice()));
                body.push_str(&picture_xml(id, &rid, rect));
            }
            Shape::Text(text) => body.push_str(&text_xml(id, text)),
            Shape::Placeholder { rect, label } => {
                body.push_str(&placeholder_xml(id, rect, label));
            }
            Shape::Table(table) => body.push_str(&table_xml(id, table)),
        }
    }
    rels.push_str("</Relationships>");

    let mut xml = String::from(XML_DECL);
    xml.push_str(&format!(
        r#"<p:sld xmlns:a="{NS_A}" xmlns:r="{NS_R}" xmlns:p="{NS_P}"><p:cSld><p:spTree>"#
    ));
    xml.push_str(r#"<p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr>"#);
    xml.push_str(r#"<p:grpSpPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="0" cy="0"/><a:chOff x="0" y="0"/><a:chExt cx="0" cy="0"/></a:xfrm></p:grpSpPr>"#);
    xml.push_str(&body);
    xml.push_str("</p:spTree></p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sld>");

    SlideParts { xml, rels, media }
}

fn xfrm(rect: &super::Rect) -> String {
    let (x, y, cx, cy) = rect.emu();
    format!(r#"<a:xfrm><a:off x="{x}" y="{y}"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm>"#)
}

fn picture_xml(id: usize, rid: &str, rect: &super::Rect) -> String {
    format!(
        concat!(
            "<p:pic><p:nvPicPr>",
            r#"<p:cNvPr id="{id}" name="Picture {id}"/><p:cNvPicPr/><p:nvPr/>"#,
            "</p:nvPicPr><p:blipFill>",
            r#"<a:blip r:embed="{rid}"/><a:stretch><a:fillRect/></a:stretch>"#,
            "</p:blipFill><p:spPr>{xfrm}",
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom>"#,
            "</p:spPr></p:pic>",
        ),
        id = id,
        rid = rid,
        xfrm = xfrm(rect),
    )
}

fn algn_attr(align: Align) -> &'static str {
    match align {
        Align::Left => "",
        Align::Center => r#" algn="ctr""#,
        Align::Right => r#" algn="r""#,
        Align::Justify => r#" algn="just""#,
    }
}

/// Paragraph properties fixing line spacing at 100% with no outer spacing.
fn paragraph_props(align: Align) -> String {
    format!(
        concat!(
            "<a:pPr{algn}>",
            r#"<a:lnSpc><a:spcPct val="100000"/></a:lnSpc>"#,
            r#"<a:spcBef><a:spcPts val="0"/></a:spcBef>"#,
            r#"<a:spcAft><a:spcPts val="0"/></a:spcAft>"#,
            "</a:pPr>",
        ),
        algn = algn_attr(align),
    )
}

fn run_props(size_pt: f64, bold: bool, italic: bool, underline: bool, color: Option<[u8; 3]>) -> String {
    let sz = (size_pt * 100.0).round() as i64;
    let mut rpr = format!(r#"<a:rPr lang="en-US" sz="{sz}""#);
    if bold {
        rpr.push_str(r#" b="1""#);
    }
    if italic {
        rpr.push_str(r#" i="1""#);
    }
    if underline {
        rpr.push_str(r#" u="sng""#);
    }
    rpr.push('>');
    if let Some([r, g, b]) = color {
        rpr.push_str(&format!(
            r#"<a:solidFill><a:srgbClr val="{r:02X}{g:02X}{b:02X}"/></a:solidFill>"#
        ));
    }
    rpr.push_str(&format!(r#"<a:latin typeface="{DEFAULT_FONT_NAME}"/>"#));
    rpr.push_str("</a:rPr>");
    rpr
}

fn text_xml(id: usize, text: &TextShape) -> String {
    let mut paragraphs = String::new();
    for line in &text.lines {
        paragraphs.push_str("<a:p>");
        paragraphs.push_str(&paragraph_props(text.align));
        paragraphs.push_str("<a:r>");
        paragraphs.push_str(&run_props(
            text.font_size_pt,
            text.bold,
            text.italic,
            text.underline,
            text.color_rgb,
        ));
        paragraphs.push_str(&format!("<a:t>{}</a:t>", escape(line.as_str())));
        paragraphs.push_str("</a:r></a:p>");
    }
    format!(
        concat!(
            "<p:sp><p:nvSpPr>",
            r#"<p:cNvPr id="{id}" name="TextBox {id}"/><p:cNvSpPr txBox="1"/><p:nvPr/>"#,
            "</p:nvSpPr><p:spPr>{xfrm}",
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom><a:noFill/>"#,
            "</p:spPr><p:txBody>",
            r#"<a:bodyPr wrap="square" lIns="0" tIns="0" rIns="0" bIns="0"/><a:lstStyle/>"#,
            "{paragraphs}",
            "</p:txBody></p:sp>",
        ),
        id = id,
        xfrm = xfrm(&text.rect),
        paragraphs = paragraphs,
    )
}

fn placeholder_xml(id: usize, rect: &super::Rect, label: &str) -> String {
    let [fr, fg, fb] = super::PLACEHOLDER_FILL;
    let [lr, lg, lb] = super::PLACEHOLDER_LINE;
    format!(
        concat!(
            "<p:sp><p:nvSpPr>",
            r#"<p:cNvPr id="{id}" name="Placeholder {id}"/><p:cNvSpPr/><p:nvPr/>"#,
            "</p:nvSpPr><p:spPr>{xfrm}",
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom>"#,
            r#"<a:solidFill><a:srgbClr val="{fill}"/></a:solidFill>"#,
            r#"<a:ln w="12700"><a:solidFill><a:srgbClr val="{line}"/></a:solidFill></a:ln>"#,
            "</p:spPr><p:txBody>",
            r#"<a:bodyPr anchor="ctr"/><a:lstStyle/>"#,
            r#"<a:p><a:pPr algn="ctr"/><a:r>"#,
            r#"<a:rPr lang="en-US" sz="1400"><a:solidFill><a:srgbClr val="64748B"/></a:solidFill><a:latin typeface="{font}"/></a:rPr>"#,
            "<a:t>{label}</a:t></a:r></a:p>",
            "</p:txBody></p:sp>",
        ),
        id = id,
        xfrm = xfrm(rect),
        fill = format!("{fr:02X}{fg:02X}{fb:02X}"),
        line = format!("{lr:02X}{lg:02X}{lb:02X}"),
        font = DEFAULT_FONT_NAME,
        label = escape(label),
    )
}

fn table_xml(id: usize, table: &TableShape) -> String {
    let (x, y, cx, cy) = table.rect.emu();
    let rows = table.grid.len().max(1) as i64;
    let cols = table.grid.first().map(Vec::len).unwrap_or(1).max(1) as i64;
    let col_w = (cx / cols).max(1);
    let row_h = (cy / rows).max(1);
    let sz = (table.font_size_pt * 100.0).round() as i64;

    let mut xml = format!(
        concat!(
            "<p:graphicFrame><p:nvGraphicFramePr>",
            r#"<p:cNvPr id="{id}" name="Table {id}"/><p:cNvGraphicFramePr/><p:nvPr/>"#,
            "</p:nvGraphicFramePr>",
            r#"<p:xfrm><a:off x="{x}" y="{y}"/><a:ext cx="{cx}" cy="{cy}"/></p:xfrm>"#,
            r#"<a:graphic><a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/table">"#,
            r#"<a:tbl><a:tblPr firstRow="1" bandRow="1"/><a:tblGrid>"#,
        ),
        id = id,
        x = x,
        y = y,
        cx = cx,
        cy = cy,
    );
    for _ in 0..cols {
        xml.push_str(&format!(r#"<a:gridCol w="{col_w}"/>"#));
    }
    xml.push_str("</a:tblGrid>");

    for (row_idx, row) in table.grid.iter().enumerate() {
        let bold = row_idx == 0;
        xml.push_str(&format!(r#"<a:tr h="{row_h}">"#));
        for cell in row {
            xml.push_str("<a:tc><a:txBody><a:bodyPr/><a:lstStyle/>");
            if cell.is_empty() {
                xml.push_str(&format!(
                    r#"<a:p><a:pPr algn="ctr"/><a:endParaRPr lang="en-US" sz="{sz}"/></a:p>"#
                ));
            } else {
                xml.push_str(r#"<a:p><a:pPr algn="ctr"/><a:r>"#);
                xml.push_str(&run_props(table.font_size_pt, bold, false, false, None));
                xml.push_str(&format!("<a:t>{}</a:t>", escape(cell.as_str())));
                xml.push_str("</a:r></a:p>");
            }
            xml.push_str("</a:txBody><a:tcPr/></a:tc>");
        }
        xml.push_str("</a:tr>");
    }

    xml.push_str("</a:tbl></a:graphicData></a:graphic></p:graphicFrame>");
    xml
}
