//! Diffusion gradient tables
//!
//! Reads FSL-style `.bval` (one row of b-values) and `.bvec` (three rows, or one
//! row per volume) text files into an ordered table of (b-value, direction)
//! pairs, one per acquisition volume.

use std::path::Path;

use crate::error::{IvimError, Result};

/// One acquisition's diffusion weighting
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientEntry {
    /// b-value in s/mm²
    pub bval: f64,
    /// Unit gradient direction (zero vector for unweighted volumes)
    pub bvec: [f64; 3],
}

/// Ordered gradient table, index-aligned with the acquisition axis
#[derive(Clone, Debug, PartialEq)]
pub struct GradientTable {
    entries: Vec<GradientEntry>,
    /// b-values at or below this count as unweighted (b0) volumes
    pub b0_threshold: f64,
}

impl GradientTable {
    pub fn new(bvals: &[f64], bvecs: &[[f64; 3]], b0_threshold: f64) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(IvimError::Gradient(format!(
                "{} b-values but {} b-vectors", bvals.len(), bvecs.len()
            )));
        }
        if bvals.is_empty() {
            return Err(IvimError::Gradient("empty gradient table".to_string()));
        }
        if let Some(b) = bvals.iter().find(|b| !b.is_finite() || **b < 0.0) {
            return Err(IvimError::Gradient(format!("invalid b-value {}", b)));
        }

        let entries = bvals
            .iter()
            .zip(bvecs)
            .map(|(&bval, v)| {
                let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
                let bvec = if norm > 1e-8 {
                    [v[0] / norm, v[1] / norm, v[2] / norm]
                } else {
                    [0.0; 3]
                };
                GradientEntry { bval, bvec }
            })
            .collect();

        Ok(Self { entries, b0_threshold })
    }

    /// Table with only b-values, directions set to zero
    pub fn from_bvals(bvals: &[f64], b0_threshold: f64) -> Result<Self> {
        Self::new(bvals, &vec![[0.0; 3]; bvals.len()], b0_threshold)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GradientEntry] {
        &self.entries
    }

    pub fn bvals(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.bval).collect()
    }

    /// Mask of unweighted volumes
    pub fn b0s_mask(&self) -> Vec<bool> {
        self.entries.iter().map(|e| e.bval <= self.b0_threshold).collect()
    }

    /// Index of the first volume with the lowest b-value
    pub fn reference_index(&self) -> usize {
        let mut best = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.bval < self.entries[best].bval {
                best = i;
            }
        }
        best
    }

    /// Fails unless the table has one entry per acquisition volume
    pub fn check_volumes(&self, n_volumes: usize) -> Result<()> {
        if self.len() != n_volumes {
            return Err(IvimError::Gradient(format!(
                "gradient table has {} entries but the series has {} volumes",
                self.len(), n_volumes
            )));
        }
        Ok(())
    }
}

fn parse_rows(text: &str, path: &Path) -> Result<Vec<Vec<f64>>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|tok| !tok.is_empty())
                .map(|tok| {
                    tok.parse::<f64>().map_err(|e| {
                        IvimError::Gradient(format!(
                            "'{}': bad number '{}': {}",
                            path.display(),
                            tok,
                            e
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

/// Parse b-values: all numbers in the file, in order
pub fn parse_bvals(text: &str, path: &Path) -> Result<Vec<f64>> {
    Ok(parse_rows(text, path)?.into_iter().flatten().collect())
}

/// Parse b-vectors in either 3xN or Nx3 layout
pub fn parse_bvecs(text: &str, path: &Path) -> Result<Vec<[f64; 3]>> {
    let rows = parse_rows(text, path)?;

    if rows.len() == 3 && rows.iter().all(|r| r.len() == rows[0].len()) {
        let n = rows[0].len();
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }
    if rows.iter().all(|r| r.len() == 3) {
        return Ok(rows.iter().map(|r| [r[0], r[1], r[2]]).collect());
    }

    Err(IvimError::Gradient(format!(
        "'{}': expected 3 rows or 3 columns of b-vector components", path.display()
    )))
}

/// Read a `.bval`/`.bvec` pair
pub fn read_bvals_bvecs(
    bval_path: &Path,
    bvec_path: &Path,
    b0_threshold: f64,
) -> Result<GradientTable> {
    let bval_text = std::fs::read_to_string(bval_path).map_err(|e| IvimError::io(bval_path, e))?;
    let bvec_text = std::fs::read_to_string(bvec_path).map_err(|e| IvimError::io(bvec_path, e))?;

    let bvals = parse_bvals(&bval_text, bval_path)?;
    let bvecs = parse_bvecs(&bvec_text, bvec_path)?;
    GradientTable::new(&bvals, &bvecs, b0_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bvecs_row_layout() {
        let text = "1 0 0 0.5\n0 1 0 0.5\n0 0 1 0\n";
        let bvecs = parse_bvecs(text, Path::new("x.bvec")).unwrap();
        assert_eq!(bvecs.len(), 4);
        assert_eq!(bvecs[1], [0.0, 1.0, 0.0]);
        assert_eq!(bvecs[3], [0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_parse_bvecs_column_layout() {
        let text = "1 0 0\n0 1 0\n0 0 1\n1 1 0\n";
        let bvecs = parse_bvecs(text, Path::new("x.bvec")).unwrap();
        assert_eq!(bvecs.len(), 4);
        assert_eq!(bvecs[3], [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_parse_bvals_bad_token() {
        let result = parse_bvals("0 50 abc", Path::new("x.bval"));
        assert!(matches!(result, Err(IvimError::Gradient(_))));
    }

    #[test]
    fn test_table_normalizes_directions() {
        let table = GradientTable::new(&[0.0, 800.0], &[[0.0; 3], [2.0, 0.0, 0.0]], 0.0).unwrap();
        assert_eq!(table.entries()[1].bvec, [1.0, 0.0, 0.0]);
        assert_eq!(table.entries()[0].bvec, [0.0; 3]);
        assert_eq!(table.b0s_mask(), vec![true, false]);
    }

    #[test]
    fn test_table_length_mismatch() {
        let result = GradientTable::new(&[0.0, 800.0], &[[0.0; 3]], 0.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_reference_index_lowest_b() {
        let table = GradientTable::from_bvals(&[50.0, 10.0, 800.0, 10.0], 0.0).unwrap();
        assert_eq!(table.reference_index(), 1);
        assert!(table.check_volumes(4).is_ok());
        assert!(table.check_volumes(5).is_err());
    }

    #[test]
    fn test_read_bvals_bvecs_files() {
        let dir = std::env::temp_dir();
        let bval = dir.join(format!("ivim_grad_{}.bval", std::process::id()));
        let bvec = dir.join(format!("ivim_grad_{}.bvec", std::process::id()));
        std::fs::write(&bval, "0 200 800\n").unwrap();
        std::fs::write(&bvec, "0 1 0\n0 0 1\n0 0 0\n").unwrap();

        let table = read_bvals_bvecs(&bval, &bvec, 0.0).unwrap();
        assert_eq!(table.bvals(), vec![0.0, 200.0, 800.0]);
        assert_eq!(table.entries()[2].bvec, [0.0, 1.0, 0.0]);

        std::fs::remove_file(&bval).ok();
        std::fs::remove_file(&bvec).ok();
    }
}
