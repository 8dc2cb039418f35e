//! Line-aligned splitting for windows and oversize units.

/// Split `text[start..end]` into spans of at most `max_chars` characters,
/// breaking at line boundaries. Consecutive spans share up to
/// `overlap_chars` characters of whole lines. A single line longer than the
/// budget is cut at character boundaries.
pub(crate) fn line_spans(
    text: &str,
    start: usize,
    end: usize,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<(usize, usize)> {
    let max_chars = max_chars.max(1);
    let pieces = pieces(text, start, end, max_chars);
    if pieces.is_empty() {
        return Vec::new();
    }

    let mut spans = Vec::new();
    let mut i = 0;
    while i < pieces.len() {
        let mut j = i;
        let mut size = 0;
        while j < pieces.len() && (j == i || size + pieces[j].2 <= max_chars) {
            size += pieces[j].2;
            j += 1;
        }
        spans.push((pieces[i].0, pieces[j - 1].1));
        if j == pieces.len() {
            break;
        }

        // Step back over whole lines for the overlap, always moving forward.
        let mut k = j;
        let mut overlap = 0;
        while k > i + 1 && overlap + pieces[k - 1].2 <= overlap_chars {
            k -= 1;
            overlap += pieces[k].2;
        }
        i = k;
    }
    spans
}

/// Lines of `text[start..end]` as (start, end, char count), with lines longer
/// than `max_chars` cut into several pieces.
fn pieces(text: &str, start: usize, end: usize, max_chars: usize) -> Vec<(usize, usize, usize)> {
    let mut out = Vec::new();
    let mut offset = start;
    for line in text[start..end].split_inclusive('\n') {
        let chars = line.chars().count();
        if chars <= max_chars {
            out.push((offset, offset + line.len(), chars));
        } else {
            let mut piece_start = 0;
            let mut count = 0;
            for (idx, _) in line.char_indices() {
                if count == max_chars {
                    out.push((offset + piece_start, offset + idx, count));
                    piece_start = idx;
                    count = 0;
                }
                count += 1;
            }
            out.push((offset + piece_start, offset + line.len(), count));
        }
        offset += line.len();
    }
    out
}
