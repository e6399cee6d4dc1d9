use std::collections::HashMap;

type Cell = (i32, i32);

const DIRECTIONS: [Cell; 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// A fully populated lattice of corner indices, `cells[j * width + i]`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Grid {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<usize>,
}

impl Grid {
    fn at(&self, i: usize, j: usize) -> usize {
        self.cells[j * self.width + i]
    }
}

fn sub(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    [a[0] - b[0], a[1] - b[1]]
}

fn norm(a: [f64; 2]) -> f64 {
    (a[0] * a[0] + a[1] * a[1]).sqrt()
}

/// Assemble detected corners into a `rows x cols` (or transposed) lattice.
///
/// Seeds closest to the centroid of the detections are tried first; growth
/// from a seed follows nearest-neighbour steps and accepts a corner only when
/// it lies within `tolerance` grid steps of the position extrapolated from
/// the already assembled neighbours.
pub(crate) fn assemble_grid(
    points: &[[f64; 2]],
    rows: usize,
    cols: usize,
    tolerance: f64,
    max_seeds: usize,
) -> Option<Grid> {
    if points.len() < rows * cols {
        return None;
    }

    let n = points.len() as f64;
    let centroid = points
        .iter()
        .fold([0.0, 0.0], |acc, p| [acc[0] + p[0] / n, acc[1] + p[1] / n]);

    let mut seeds: Vec<usize> = (0..points.len()).collect();
    seeds.sort_by(|&a, &b| {
        norm(sub(points[a], centroid))
            .total_cmp(&norm(sub(points[b], centroid)))
            .then(a.cmp(&b))
    });

    seeds.into_iter().take(max_seeds).find_map(|seed| {
        let grid = grow_from_seed(points, seed, rows, cols, tolerance);
        if grid.is_none() {
            log::trace!("grid growth from seed {seed} failed");
        }
        grid
    })
}

fn grow_from_seed(
    points: &[[f64; 2]],
    seed: usize,
    rows: usize,
    cols: usize,
    tolerance: f64,
) -> Option<Grid> {
    let origin = points[seed];
    let mut neighbours: Vec<usize> = (0..points.len()).filter(|&k| k != seed).collect();
    neighbours.sort_by(|&a, &b| {
        norm(sub(points[a], origin)).total_cmp(&norm(sub(points[b], origin)))
    });

    let first = *neighbours.first()?;
    let d1 = sub(points[first], origin);
    let l1 = norm(d1);
    if l1 <= f64::EPSILON {
        return None;
    }

    // second axis: the nearest neighbour roughly orthogonal to the first
    let second = neighbours.iter().skip(1).take(8).copied().find(|&k| {
        let d2 = sub(points[k], origin);
        let l2 = norm(d2);
        let cos = (d1[0] * d2[0] + d1[1] * d2[1]) / (l1 * l2);
        l2 > 0.5 * l1 && l2 < 2.0 * l1 && cos.abs() < 0.5
    })?;

    let max_extent = rows.max(cols) as i32;
    let mut cells: HashMap<Cell, usize> = HashMap::new();
    let mut used = vec![false; points.len()];
    for (cell, idx) in [((0, 0), seed), ((1, 0), first), ((0, 1), second)] {
        cells.insert(cell, idx);
        used[idx] = true;
    }

    loop {
        let mut frontier: Vec<Cell> = cells
            .keys()
            .flat_map(|&(i, j)| DIRECTIONS.iter().map(move |&(di, dj)| (i + di, j + dj)))
            .filter(|c| !cells.contains_key(c))
            .collect();
        frontier.sort_unstable();
        frontier.dedup();

        let mut changed = false;
        for target in frontier {
            if cells.contains_key(&target) || !within_extent(&cells, target, max_extent) {
                continue;
            }
            let Some((pred, step)) = predict(&cells, points, target) else {
                continue;
            };

            let best = points
                .iter()
                .enumerate()
                .filter(|(k, _)| !used[*k])
                .map(|(k, p)| (k, norm(sub(*p, pred))))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((k, dist)) = best {
                if dist < tolerance * step {
                    cells.insert(target, k);
                    used[k] = true;
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }

    let (min_i, max_i, min_j, max_j) = extents(&cells);
    let width = (max_i - min_i + 1) as usize;
    let height = (max_j - min_j + 1) as usize;
    let shape_ok = (width == rows && height == cols) || (width == cols && height == rows);
    if !shape_ok || cells.len() != rows * cols {
        log::trace!(
            "seed {seed}: grew a {width}x{height} lattice with {} corners",
            cells.len()
        );
        return None;
    }

    let mut grid = vec![0; width * height];
    for (&(i, j), &idx) in &cells {
        grid[(j - min_j) as usize * width + (i - min_i) as usize] = idx;
    }

    Some(Grid {
        width,
        height,
        cells: grid,
    })
}

fn extents(cells: &HashMap<Cell, usize>) -> (i32, i32, i32, i32) {
    cells.keys().fold(
        (i32::MAX, i32::MIN, i32::MAX, i32::MIN),
        |(a, b, c, d), &(i, j)| (a.min(i), b.max(i), c.min(j), d.max(j)),
    )
}

fn within_extent(cells: &HashMap<Cell, usize>, target: Cell, max_extent: i32) -> bool {
    let (min_i, max_i, min_j, max_j) = extents(cells);
    let width = max_i.max(target.0) - min_i.min(target.0) + 1;
    let height = max_j.max(target.1) - min_j.min(target.1) + 1;
    width <= max_extent && height <= max_extent
}

/// Predict the image position of `target` from its assembled neighbours.
///
/// Uses linear extrapolation along a line of two assembled cells and
/// parallelogram completion from an assembled corner triple, averaging all
/// that apply. Also returns the local grid step length.
fn predict(
    cells: &HashMap<Cell, usize>,
    points: &[[f64; 2]],
    target: Cell,
) -> Option<([f64; 2], f64)> {
    let at = |c: Cell| cells.get(&c).map(|&k| points[k]);

    let mut sum = [0.0, 0.0];
    let mut step_sum = 0.0;
    let mut count = 0usize;

    for &(di, dj) in &DIRECTIONS {
        let Some(p1) = at((target.0 - di, target.1 - dj)) else {
            continue;
        };

        if let Some(p2) = at((target.0 - 2 * di, target.1 - 2 * dj)) {
            let pred = [2.0 * p1[0] - p2[0], 2.0 * p1[1] - p2[1]];
            sum = [sum[0] + pred[0], sum[1] + pred[1]];
            step_sum += norm(sub(p1, p2));
            count += 1;
        }

        // perpendicular directions
        for (ei, ej) in [(dj, di), (-dj, -di)] {
            let (Some(pe), Some(pde)) = (
                at((target.0 - ei, target.1 - ej)),
                at((target.0 - di - ei, target.1 - dj - ej)),
            ) else {
                continue;
            };
            let pred = [p1[0] + pe[0] - pde[0], p1[1] + pe[1] - pde[1]];
            sum = [sum[0] + pred[0], sum[1] + pred[1]];
            step_sum += norm(sub(pe, pde));
            count += 1;
        }
    }

    (count > 0).then(|| {
        let c = count as f64;
        ([sum[0] / c, sum[1] / c], step_sum / c)
    })
}

/// Order the lattice canonically as `k = j * rows + i`.
///
/// The fast axis `i` has `rows` corners. Corner 0 is the lattice corner with
/// the smallest `u + v`; for square patterns the fast axis is the one closest
/// to the image horizontal.
pub(crate) fn canonical_order(grid: &Grid, points: &[[f64; 2]], rows: usize, cols: usize) -> Vec<usize> {
    // (transpose, flip_a, flip_b)
    let mut orientations = Vec::new();
    for transpose in [false, true] {
        let (w, h) = if transpose {
            (grid.height, grid.width)
        } else {
            (grid.width, grid.height)
        };
        if w != rows || h != cols {
            continue;
        }
        for flip_a in [false, true] {
            for flip_b in [false, true] {
                orientations.push((transpose, flip_a, flip_b));
            }
        }
    }

    let lookup = |o: (bool, bool, bool), a: usize, b: usize| -> usize {
        let (transpose, flip_a, flip_b) = o;
        let a = if flip_a { rows - 1 - a } else { a };
        let b = if flip_b { cols - 1 - b } else { b };
        if transpose {
            grid.at(b, a)
        } else {
            grid.at(a, b)
        }
    };

    let corner_score = |idx: usize| points[idx][0] + points[idx][1];
    let horizontalness = |o: (bool, bool, bool)| {
        let d = sub(points[lookup(o, 1, 0)], points[lookup(o, 0, 0)]);
        d[0].abs() / (d[0].abs() + d[1].abs()).max(f64::EPSILON)
    };

    let best = orientations.into_iter().min_by(|&a, &b| {
        corner_score(lookup(a, 0, 0))
            .total_cmp(&corner_score(lookup(b, 0, 0)))
            .then(horizontalness(b).total_cmp(&horizontalness(a)))
    });

    match best {
        Some(o) => (0..cols)
            .flat_map(|b| (0..rows).map(move |a| (a, b)))
            .map(|(a, b)| lookup(o, a, b))
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice(rows: usize, cols: usize, angle: f64) -> Vec<[f64; 2]> {
        let (s, c) = angle.sin_cos();
        let mut pts = Vec::new();
        for j in 0..cols {
            for i in 0..rows {
                let (x, y) = (i as f64 * 20.0, j as f64 * 20.0);
                pts.push([100.0 + c * x - s * y, 80.0 + s * x + c * y]);
            }
        }
        pts
    }

    #[test]
    fn test_assemble_rectangular_lattice() {
        let mut pts = lattice(4, 6, 0.1);
        // shuffle deterministically and add an outlier
        pts.reverse();
        pts.swap(3, 11);
        pts.push([5.0, 5.0]);

        let grid = assemble_grid(&pts, 4, 6, 0.35, 8).expect("lattice should assemble");
        assert_eq!(grid.width * grid.height, 24);
        assert!(!grid.cells.contains(&24));

        let order = canonical_order(&grid, &pts, 4, 6);
        assert_eq!(order.len(), 24);
        let ordered: Vec<[f64; 2]> = order.iter().map(|&k| pts[k]).collect();
        let expected = lattice(4, 6, 0.1);
        for (a, b) in ordered.iter().zip(&expected) {
            assert!((a[0] - b[0]).abs() < 1e-9 && (a[1] - b[1]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_square_lattice_prefers_horizontal_fast_axis() {
        let pts = lattice(5, 5, 0.05);
        let grid = assemble_grid(&pts, 5, 5, 0.35, 8).expect("lattice should assemble");
        let order = canonical_order(&grid, &pts, 5, 5);
        let (p0, p1) = (pts[order[0]], pts[order[1]]);
        assert!((p1[0] - p0[0]).abs() > (p1[1] - p0[1]).abs());
        assert_eq!(order[0], 0);
    }

    #[test]
    fn test_incomplete_lattice_fails() {
        let mut pts = lattice(4, 6, 0.0);
        pts.remove(9);
        pts.push([500.0, 500.0]);
        assert!(assemble_grid(&pts, 4, 6, 0.35, 8).is_none());
    }
}
