/// A named parameter block in an optimization problem.
///
/// Individual components can be held fixed; the optimizer never updates them
/// and they do not contribute columns to the linear system.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Name of the variable (used for referencing in factors)
    pub name: String,
    /// Current parameter values
    pub values: Vec<f64>,
    fixed: Vec<bool>,
}

impl Variable {
    /// Create a new variable with all components free.
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        let fixed = vec![false; values.len()];
        Self {
            name: name.into(),
            values,
            fixed,
        }
    }

    /// Create a zero-initialized variable of the given dimension.
    pub fn zeros(name: impl Into<String>, dim: usize) -> Self {
        Self::new(name, vec![0.0; dim])
    }

    /// Hold the components at `indices` fixed. Out of range indices are ignored.
    pub fn with_fixed(mut self, indices: &[usize]) -> Self {
        for &i in indices {
            if let Some(f) = self.fixed.get_mut(i) {
                *f = true;
            }
        }
        self
    }

    /// Hold every component fixed.
    pub fn with_all_fixed(mut self) -> Self {
        self.fixed.iter_mut().for_each(|f| *f = true);
        self
    }

    /// Number of components.
    #[inline]
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Whether component `idx` is held fixed.
    #[inline]
    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed.get(idx).copied().unwrap_or(true)
    }

    /// Indices of the components the optimizer may update.
    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.dim()).filter(|&i| !self.fixed[i]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_helpers() {
        let var = Variable::zeros("foo", 4);
        assert_eq!(var.name, "foo");
        assert_eq!(var.dim(), 4);
        assert_eq!(var.free_indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_variable_fixed_components() {
        let var = Variable::new("k", vec![1.0, 2.0, 3.0]).with_fixed(&[1, 7]);
        assert!(!var.is_fixed(0));
        assert!(var.is_fixed(1));
        assert_eq!(var.free_indices(), vec![0, 2]);

        let var = var.with_all_fixed();
        assert!(var.free_indices().is_empty());
    }
}
