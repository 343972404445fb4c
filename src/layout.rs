//! Page layout for printed rapor tables.
//!
//! Row heights are estimated from text length, then rows are packed greedily:
//! the first page loses room to the student identity header, later pages only
//! repeat the table header. Rows are never split across pages.

use serde::{Deserialize, Serialize};

const FIT_EPSILON: f64 = 1e-6;

/// Page geometry in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutConfig {
    /// Usable page height inside the margins.
    pub page_height: f64,
    /// Identity block plus table header on the first page.
    pub header_height: f64,
    /// Repeated table header on continuation pages.
    pub continuation_header_height: f64,
    /// Attendance, notes and signatures after the last row. Zero disables it.
    pub footer_height: f64,
    pub line_height: f64,
    /// Applied above and below the text of every cell.
    pub cell_padding: f64,
    pub min_row_height: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            page_height: 257.0,
            header_height: 48.0,
            continuation_header_height: 10.0,
            footer_height: 92.0,
            line_height: 4.5,
            cell_padding: 1.5,
            min_row_height: 8.0,
        }
    }
}

impl LayoutConfig {
    pub fn first_capacity(&self) -> f64 {
        (self.page_height - self.header_height).max(0.0)
    }

    pub fn continuation_capacity(&self) -> f64 {
        (self.page_height - self.continuation_header_height).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub text: String,
    pub chars_per_line: usize,
}

impl Cell {
    pub fn new(text: impl Into<String>, chars_per_line: usize) -> Self {
        Self {
            text: text.into(),
            chars_per_line,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSpec {
    pub cells: Vec<Cell>,
    /// Never leave this row last on a page ahead of the row after it.
    pub keep_with_next: bool,
}

/// Number of printed lines `text` wraps to in a column `chars_per_line` wide.
pub fn estimate_lines(text: &str, chars_per_line: usize) -> usize {
    let width = chars_per_line.max(1);
    let mut total = 0_usize;
    for para in text.split('\n') {
        let mut lines = 1_usize;
        let mut used = 0_usize;
        for word in para.split_whitespace() {
            let mut len = word.chars().count();
            if used > 0 {
                if used + 1 + len <= width {
                    used += 1 + len;
                    continue;
                }
                lines += 1;
            }
            // Words wider than the column are hard-broken.
            while len > width {
                lines += 1;
                len -= width;
            }
            used = len;
        }
        total += lines;
    }
    total.max(1)
}

pub fn estimate_row_height(row: &RowSpec, cfg: &LayoutConfig) -> f64 {
    let lines = row
        .cells
        .iter()
        .map(|c| estimate_lines(&c.text, c.chars_per_line))
        .max()
        .unwrap_or(1);
    let h = (lines as f64) * cfg.line_height + 2.0 * cfg.cell_padding;
    h.max(cfg.min_row_height)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedRow {
    /// Position of the row in the input.
    pub index: usize,
    pub top: f64,
    pub height: f64,
    pub oversized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub index: usize,
    pub first: bool,
    pub capacity: f64,
    pub used_height: f64,
    pub rows: Vec<PlacedRow>,
    pub has_footer: bool,
}

impl Page {
    fn new(index: usize, first: bool, capacity: f64) -> Self {
        Self {
            index,
            first,
            capacity,
            used_height: 0.0,
            rows: Vec::new(),
            has_footer: false,
        }
    }

    fn remaining(&self) -> f64 {
        self.capacity - self.used_height
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub pages: Vec<Page>,
    pub footer_page: Option<usize>,
}

impl Pagination {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Greedy packing of pre-measured rows.
pub fn paginate(heights: &[f64], cfg: &LayoutConfig) -> Pagination {
    paginate_keeping(heights, &[], cfg)
}

/// Like [`paginate`], but a row flagged in `keep_with_next` only stays on the
/// current page when the row after it fits there too.
pub fn paginate_keeping(heights: &[f64], keep_with_next: &[bool], cfg: &LayoutConfig) -> Pagination {
    let mut pages = vec![Page::new(0, true, cfg.first_capacity())];

    for (index, &height) in heights.iter().enumerate() {
        let needed = match heights.get(index + 1) {
            Some(next) if keep_with_next.get(index).copied().unwrap_or(false) => height + next,
            _ => height,
        };
        let needs_new_page = pages
            .last()
            .map(|p| !p.rows.is_empty() && needed > p.remaining() + FIT_EPSILON)
            .unwrap_or(true);
        if needs_new_page {
            let next = pages.len();
            pages.push(Page::new(next, false, cfg.continuation_capacity()));
        }
        let Some(page) = pages.last_mut() else {
            continue;
        };
        page.rows.push(PlacedRow {
            index,
            top: page.used_height,
            height,
            oversized: height > page.capacity + FIT_EPSILON,
        });
        page.used_height += height;
    }

    let mut footer_page = None;
    if cfg.footer_height > 0.0 {
        let fits = pages
            .last()
            .map(|p| cfg.footer_height <= p.remaining() + FIT_EPSILON)
            .unwrap_or(false);
        if !fits {
            let next = pages.len();
            pages.push(Page::new(next, false, cfg.continuation_capacity()));
        }
        if let Some(page) = pages.last_mut() {
            page.has_footer = true;
            footer_page = Some(page.index);
        }
    }

    Pagination { pages, footer_page }
}

/// Estimate every row and paginate. Returns the heights alongside the layout.
pub fn paginate_rows(rows: &[RowSpec], cfg: &LayoutConfig) -> (Vec<f64>, Pagination) {
    let heights: Vec<f64> = rows.iter().map(|r| estimate_row_height(r, cfg)).collect();
    let keep: Vec<bool> = rows.iter().map(|r| r.keep_with_next).collect();
    let pagination = paginate_keeping(&heights, &keep, cfg);
    (heights, pagination)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LayoutConfig {
        LayoutConfig {
            page_height: 100.0,
            header_height: 40.0,
            continuation_header_height: 10.0,
            footer_height: 0.0,
            line_height: 5.0,
            cell_padding: 1.0,
            min_row_height: 8.0,
        }
    }

    #[test]
    fn lines_wrap_on_words_and_hard_break_long_words() {
        assert_eq!(estimate_lines("", 10), 1);
        assert_eq!(estimate_lines("aaaa bbbb", 10), 1);
        assert_eq!(estimate_lines("aaaa bbbbbb", 10), 2);
        assert_eq!(estimate_lines("abcdefghijklmnopqrstuvwxy", 10), 3);
        assert_eq!(estimate_lines("satu\ndua\n", 10), 3);
        assert_eq!(estimate_lines("abc", 0), 3);
    }

    #[test]
    fn row_height_uses_tallest_cell_and_minimum() {
        let c = cfg();
        let short = RowSpec {
            cells: vec![Cell::new("IPA", 20)],
            keep_with_next: false,
        };
        assert_eq!(estimate_row_height(&short, &c), 8.0);

        let tall = RowSpec {
            cells: vec![
                Cell::new("IPA", 20),
                Cell::new("satu dua tiga empat lima enam", 10),
            ],
            keep_with_next: false,
        };
        // 3 lines * 5 + 2 * 1
        assert_eq!(estimate_row_height(&tall, &c), 17.0);
    }

    #[test]
    fn first_page_has_reduced_capacity_and_order_is_kept() {
        let heights = vec![20.0; 10];
        let p = paginate(&heights, &cfg());
        // first page: 60 -> 3 rows; continuation: 90 -> 4 rows
        let counts: Vec<usize> = p.pages.iter().map(|pg| pg.rows.len()).collect();
        assert_eq!(counts, vec![3, 4, 3]);
        assert!(p.pages[0].first);
        assert!(p.pages[0].used_height <= cfg().first_capacity());

        let order: Vec<usize> = p
            .pages
            .iter()
            .flat_map(|pg| pg.rows.iter().map(|r| r.index))
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn oversized_row_gets_its_own_page() {
        let p = paginate(&[10.0, 120.0, 10.0], &cfg());
        assert_eq!(p.page_count(), 3);
        assert_eq!(p.pages[1].rows.len(), 1);
        assert!(p.pages[1].rows[0].oversized);
        assert!(!p.pages[0].rows[0].oversized);
        assert_eq!(p.pages[2].rows[0].index, 2);
    }

    #[test]
    fn footer_moves_to_a_new_page_when_it_does_not_fit() {
        let mut c = cfg();
        c.footer_height = 30.0;

        let fits = paginate(&[20.0], &c);
        assert_eq!(fits.page_count(), 1);
        assert_eq!(fits.footer_page, Some(0));
        assert!(fits.pages[0].has_footer);

        let spills = paginate(&[20.0, 20.0, 20.0], &c);
        assert_eq!(spills.page_count(), 2);
        assert!(spills.pages[1].rows.is_empty());
        assert_eq!(spills.footer_page, Some(1));
    }

    #[test]
    fn kept_row_moves_down_with_its_follower() {
        // 20 + 20 leaves 20 on the first page: the 10-high heading fits alone
        // but not together with the 20-high row after it.
        let heights = [20.0, 20.0, 10.0, 20.0];
        let loose = paginate(&heights, &cfg());
        let loose_first: Vec<usize> = loose.pages[0].rows.iter().map(|r| r.index).collect();
        assert_eq!(loose_first, vec![0, 1, 2]);

        let kept = paginate_keeping(&heights, &[false, false, true, false], &cfg());
        let pages: Vec<Vec<usize>> = kept
            .pages
            .iter()
            .map(|p| p.rows.iter().map(|r| r.index).collect())
            .collect();
        assert_eq!(pages, vec![vec![0, 1], vec![2, 3]]);

        // A kept row that is already alone at the top of a page stays put.
        let tall = paginate_keeping(&[10.0, 80.0], &[true, false], &cfg());
        assert_eq!(tall.pages[0].rows.len(), 1);
        assert_eq!(tall.page_count(), 2);
    }

    #[test]
    fn no_rows_yield_a_single_first_page() {
        let p = paginate(&[], &cfg());
        assert_eq!(p.page_count(), 1);
        assert!(p.pages[0].first);
        assert_eq!(p.footer_page, None);
    }
}
