//! Discrete font-fitting search for text boxes.
//!
//! Wrapping is not continuous in font size (halving the size does not halve
//! the line count), so the fit is a linear search over integer point sizes
//! from largest to smallest rather than a closed-form solve.

/// Smallest font size the builder will emit, in points.
pub const MIN_FONT_SIZE: f64 = 6.0;

/// Largest font size the builder will emit, in points.
pub const MAX_FONT_SIZE: f64 = 200.0;

/// Line height as a multiple of the font size.
const LINE_HEIGHT_RATIO: f64 = 1.0;

/// Outcome of a fitting search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontFit {
    /// Accepted size in points.
    pub size: f64,
    /// False when even [`MIN_FONT_SIZE`] overflows the box.
    pub fits: bool,
}

/// Estimated rendered width of one line, in points, at `font_size`.
///
/// Character-count heuristic: CJK glyphs occupy a full em, everything else
/// half an em. Close enough for box fitting; no font file required.
pub fn estimate_line_width(line: &str, font_size: f64) -> f64 {
    let cjk = line.chars().filter(|c| is_cjk(*c)).count();
    let other = line.chars().count() - cjk;
    (cjk as f64 + other as f64 * 0.5) * font_size
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'   // CJK unified ideographs
        | '\u{3040}'..='\u{30ff}' // hiragana + katakana
        | '\u{ac00}'..='\u{d7af}' // hangul syllables
    )
}

/// Largest integer point size at which `text` fits a `width_pt` x
/// `height_pt` box, wrapping each explicit line as needed.
///
/// Explicit `\n` lines are measured independently; each contributes
/// `ceil(line_width / width_pt)` wrapped lines (empty lines count as one).
/// The first size whose total height fits is accepted.
pub fn fit_font_size(text: &str, width_pt: f64, height_pt: f64) -> FontFit {
    if width_pt <= 0.0 || height_pt <= 0.0 {
        return FontFit {
            size: MIN_FONT_SIZE,
            fits: false,
        };
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut size = MAX_FONT_SIZE as i64;
    while size >= MIN_FONT_SIZE as i64 {
        let font_size = size as f64;
        let mut total_lines = 0usize;
        for line in &lines {
            if line.is_empty() {
                total_lines += 1;
                continue;
            }
            let line_width = estimate_line_width(line, font_size);
            total_lines += (line_width / width_pt).ceil().max(1.0) as usize;
        }
        let total_height = total_lines as f64 * font_size * LINE_HEIGHT_RATIO;
        if total_height <= height_pt {
            return FontFit {
                size: font_size,
                fits: true,
            };
        }
        size -= 1;
    }
    FontFit {
        size: MIN_FONT_SIZE,
        fits: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_line_in_huge_box_gets_the_maximum() {
        let fit = fit_font_size("Hi", 4000.0, 1000.0);
        assert!(fit.fits);
        assert_eq!(fit.size, MAX_FONT_SIZE);
    }

    #[test]
    fn wrapping_drives_the_accepted_size() {
        // 10 half-em chars: width 5s pt. At s=15 the line wraps into two
        // 15pt lines (30 > 20); s=14 fits on one line under 20pt.
        let fit = fit_font_size("HelloWorld", 72.0, 20.0);
        assert!(fit.fits);
        assert_eq!(fit.size, 14.0);
    }

    #[test]
    fn longer_text_never_raises_the_size() {
        let mut prev = f64::INFINITY;
        for n in 1..=6 {
            let fit = fit_font_size(&"lorem ipsum ".repeat(n), 300.0, 120.0);
            assert!(fit.size <= prev, "size grew at n={n}: {} > {prev}", fit.size);
            assert!((MIN_FONT_SIZE..=MAX_FONT_SIZE).contains(&fit.size));
            prev = fit.size;
        }
    }

    #[test]
    fn cjk_characters_count_double() {
        let cjk = estimate_line_width("你好", 10.0);
        let latin = estimate_line_width("ab", 10.0);
        assert_eq!(cjk, 20.0);
        assert_eq!(latin, 10.0);
    }

    #[test]
    fn explicit_lines_stack_vertically() {
        let single = fit_font_size("abc", 720.0, 30.0);
        let triple = fit_font_size("abc\nabc\nabc", 720.0, 30.0);
        assert!(triple.size < single.size);
        // Three lines at 10pt fill exactly 30pt.
        assert_eq!(triple.size, 10.0);
    }

    #[test]
    fn empty_lines_still_take_a_row() {
        let with_gap = fit_font_size("a\n\na", 720.0, 30.0);
        assert_eq!(with_gap.size, 10.0);
    }

    #[test]
    fn overflow_reports_min_without_fitting() {
        let fit = fit_font_size(&"x".repeat(4000), 30.0, 10.0);
        assert!(!fit.fits);
        assert_eq!(fit.size, MIN_FONT_SIZE);
    }

    #[test]
    fn degenerate_box_reports_min() {
        let fit = fit_font_size("text", 0.0, 50.0);
        assert!(!fit.fits);
        assert_eq!(fit.size, MIN_FONT_SIZE);
    }
}
