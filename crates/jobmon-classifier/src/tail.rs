use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Hard cap on how many trailing log lines are ever classified.
pub const MAX_CLASSIFIED_LINES: usize = 500;

/// Hard cap on bytes read from the end of a log, whatever its line structure.
///
/// Progress bars redraw with `\r` and can leave gigabytes without a newline.
pub const MAX_TAIL_BYTES: u64 = MAX_CLASSIFIED_LINES as u64 * 4 * 1024;

const TAIL_BLOCK_BYTES: u64 = 16 * 1024;

/// Reads at most the last `max_lines` lines of `path`.
///
/// Blocks are read backwards from the end until enough newlines are seen or
/// `MAX_TAIL_BYTES` have been read, so memory and time stay bounded on any
/// file. Invalid UTF-8 is replaced lossily.
pub fn read_tail_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let (tail, truncated) = read_tail_bytes(&mut file, max_lines, MAX_TAIL_BYTES)?;

    let text = String::from_utf8_lossy(&tail);
    let lines = text.lines().collect::<Vec<_>>();
    let mut skip = lines.len().saturating_sub(max_lines);
    if truncated && skip == 0 && lines.len() > 1 {
        // First line may be a fragment of a longer line; drop it.
        skip = 1;
    }
    Ok(lines
        .into_iter()
        .skip(skip)
        .map(str::to_string)
        .collect())
}

/// Trailing bytes of `file` and whether anything before them was left unread.
fn read_tail_bytes<R: Read + Seek>(
    file: &mut R,
    max_lines: usize,
    max_bytes: u64,
) -> io::Result<(Vec<u8>, bool)> {
    let file_len = file.seek(SeekFrom::End(0))?;
    let floor = file_len.saturating_sub(max_bytes);

    let mut blocks: VecDeque<Vec<u8>> = VecDeque::new();
    let mut newlines = 0usize;
    let mut offset = file_len;
    while offset > floor {
        let read_len = TAIL_BLOCK_BYTES.min(offset - floor);
        offset -= read_len;
        file.seek(SeekFrom::Start(offset))?;
        let mut block = vec![0u8; read_len as usize];
        file.read_exact(&mut block)?;
        newlines += count_newlines(&block);
        blocks.push_front(block);

        // One extra newline guarantees the first kept line is complete.
        if newlines > max_lines {
            break;
        }
    }

    let mut tail = Vec::with_capacity((file_len - offset) as usize);
    for block in blocks {
        tail.extend_from_slice(&block);
    }
    Ok((tail, offset > 0))
}

fn count_newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|byte| **byte == b'\n').count()
}
