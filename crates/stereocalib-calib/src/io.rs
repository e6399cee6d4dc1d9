//! Text formats exchanged with the point picker and the playback tools.
//!
//! Clicked points:
//!
//! ```text
//! uvs1 = [
//!     [412, 233],
//!     [398.5, 301],
//! ]
//!
//! uvs2 = [
//!     [287, 240],
//!     [270, 309.25],
//! ]
//! ```
//!
//! Keypoints: one line per frame with `x y z` for every keypoint, `-1 -1 -1`
//! for a keypoint that was not observed. A blank line ends the data.

use std::io::Write as _;
use std::path::Path;

use stereocalib_3d::triangulation::StereoObservation;
use stereocalib_3d::{Point2, Point3};

/// Marker of a missing keypoint coordinate.
const MISSING: f64 = -1.0;

/// Errors of the point file readers and writers.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The text does not follow the format.
    #[error("Parse error at line {line}: {message}")]
    Parse {
        /// 1-based line of the error.
        line: usize,
        /// What was expected.
        message: String,
    },

    /// A required list is absent.
    #[error("Missing section '{0}'")]
    MissingSection(&'static str),

    /// The two lists of clicked points have different lengths.
    #[error("Clicked points mismatch: {left} left and {right} right points")]
    MismatchedLengths {
        /// Number of left points.
        left: usize,
        /// Number of right points.
        right: usize,
    },
}

/// Cursor over the clicked points text.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str, pos: usize) -> Self {
        Self { text, pos }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    fn error(&self, message: impl Into<String>) -> IoError {
        IoError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.text[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<(), IoError> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(found) => Err(self.error(format!("expected '{c}', found '{found}'"))),
            None => Err(self.error(format!("expected '{c}', found end of input"))),
        }
    }

    /// Consume `c` if it is the next non-blank character.
    fn accept(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn number(&mut self) -> Result<f64, IoError> {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
            .unwrap_or(rest.len());
        let value = rest[..len]
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number '{}'", &rest[..len])))?;
        self.pos += len;
        Ok(value)
    }

    /// `[[u, v], ...]` with optional trailing commas.
    fn point_list(&mut self) -> Result<Vec<Point2>, IoError> {
        self.expect('[')?;
        let mut points = Vec::new();
        while !self.accept(']') {
            self.expect('[')?;
            let u = self.number()?;
            self.expect(',')?;
            let v = self.number()?;
            self.accept(',');
            self.expect(']')?;
            points.push([u, v]);
            if !self.accept(',') {
                self.expect(']')?;
                break;
            }
        }
        Ok(points)
    }
}

fn section(text: &str, name: &'static str) -> Result<Vec<Point2>, IoError> {
    let start = text
        .match_indices(name)
        .map(|(i, _)| i + name.len())
        .find(|&i| text[i..].trim_start().starts_with('='))
        .ok_or(IoError::MissingSection(name))?;
    let mut scanner = Scanner::new(text, start);
    scanner.expect('=')?;
    scanner.point_list()
}

/// Parse clicked points into left/right observation pairs, in click order.
pub fn parse_clicked_points(text: &str) -> Result<Vec<StereoObservation>, IoError> {
    let left = section(text, "uvs1")?;
    let right = section(text, "uvs2")?;
    if left.len() != right.len() {
        return Err(IoError::MismatchedLengths {
            left: left.len(),
            right: right.len(),
        });
    }
    Ok(left
        .into_iter()
        .zip(right)
        .map(|(l, r)| StereoObservation::new(l, r))
        .collect())
}

/// Read a clicked points file.
pub fn read_clicked_points(path: impl AsRef<Path>) -> Result<Vec<StereoObservation>, IoError> {
    parse_clicked_points(&std::fs::read_to_string(path)?)
}

/// Format observation pairs as clicked points text.
pub fn format_clicked_points(observations: &[StereoObservation]) -> String {
    let mut out = String::new();
    for (name, right) in [("uvs1", false), ("uvs2", true)] {
        out.push_str(&format!("{name} = [\n"));
        for obs in observations {
            let [u, v] = if right { obs.right } else { obs.left };
            out.push_str(&format!("    [{u}, {v}],\n"));
        }
        out.push_str("]\n\n");
    }
    out
}

/// Write a clicked points file.
pub fn write_clicked_points(
    path: impl AsRef<Path>,
    observations: &[StereoObservation],
) -> Result<(), IoError> {
    std::fs::write(path, format_clicked_points(observations))?;
    Ok(())
}

/// Parse keypoint frames.
///
/// A keypoint with any coordinate equal to `-1` is missing.
pub fn parse_keypoints(text: &str) -> Result<Vec<Vec<Option<Point3>>>, IoError> {
    let mut frames = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            break;
        }
        let values = line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IoError::Parse {
                line: idx + 1,
                message: e.to_string(),
            })?;
        if values.len() % 3 != 0 {
            return Err(IoError::Parse {
                line: idx + 1,
                message: format!("{} values is not a multiple of 3", values.len()),
            });
        }
        frames.push(
            values
                .chunks_exact(3)
                .map(|c| (!c.contains(&MISSING)).then(|| [c[0], c[1], c[2]]))
                .collect(),
        );
    }
    Ok(frames)
}

/// Read a keypoints file.
pub fn read_keypoints(path: impl AsRef<Path>) -> Result<Vec<Vec<Option<Point3>>>, IoError> {
    parse_keypoints(&std::fs::read_to_string(path)?)
}

/// Write keypoint frames, one line per frame.
pub fn write_keypoints(
    path: impl AsRef<Path>,
    frames: &[Vec<Option<Point3>>],
) -> Result<(), IoError> {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
    for frame in frames {
        let line = frame
            .iter()
            .map(|p| {
                let [x, y, z] = p.unwrap_or([MISSING; 3]);
                format!("{x} {y} {z}")
            })
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLICKED: &str = "uvs1 = [\n    [412, 233],\n    [398.5, 301],\n]\n\nuvs2 = [\n    [287, 240],\n    [270, 309.25],\n]\n";

    #[test]
    fn test_parse_clicked_points() -> Result<(), IoError> {
        let obs = parse_clicked_points(CLICKED)?;
        assert_eq!(
            obs,
            vec![
                StereoObservation::new([412.0, 233.0], [287.0, 240.0]),
                StereoObservation::new([398.5, 301.0], [270.0, 309.25]),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_clicked_points_format_roundtrip() -> Result<(), IoError> {
        let obs = parse_clicked_points(CLICKED)?;
        assert_eq!(parse_clicked_points(&format_clicked_points(&obs))?, obs);
        Ok(())
    }

    #[test]
    fn test_format_clicked_points_text() -> Result<(), IoError> {
        let obs = parse_clicked_points(CLICKED)?;
        assert_eq!(format_clicked_points(&obs), format!("{CLICKED}\n"));
        assert_eq!(format_clicked_points(&[]), "uvs1 = [\n]\n\nuvs2 = [\n]\n\n");
        Ok(())
    }

    #[test]
    fn test_clicked_points_errors() {
        let unequal = "uvs1 = [[1, 2], [3, 4]]\nuvs2 = [[1, 2]]";
        assert!(matches!(
            parse_clicked_points(unequal),
            Err(IoError::MismatchedLengths { left: 2, right: 1 })
        ));
        assert!(matches!(
            parse_clicked_points("uvs1 = [[1, 2]]"),
            Err(IoError::MissingSection("uvs2"))
        ));
        assert!(matches!(
            parse_clicked_points("uvs1 = [[1, 2]]\nuvs2 = [[1 2]]"),
            Err(IoError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_keypoints_stops_at_blank_line() -> Result<(), IoError> {
        let text = "0.1 0.2 2 -1 -1 -1\n0.3 0.4 2.5 1 1 3\n\n9 9 9 9 9 9\n";
        let frames = parse_keypoints(text)?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![Some([0.1, 0.2, 2.0]), None]);
        assert_eq!(frames[1], vec![Some([0.3, 0.4, 2.5]), Some([1.0, 1.0, 3.0])]);

        assert!(matches!(
            parse_keypoints("1 2 3 4\n"),
            Err(IoError::Parse { line: 1, .. })
        ));
        Ok(())
    }
}
