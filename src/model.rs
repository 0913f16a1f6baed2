// model.rs

use std::collections::HashSet;
use std::sync::Arc;

use crate::pca::PcaError;

/// The fixed, ordered list of measured gene names shared by every cell line
/// in a run.
///
/// Constructed once from the expression table's surviving gene set and frozen
/// for the remainder of the run; every `CellLine` holds it by `Arc`, so two
/// concurrent runs (or two test cases) with different schemas cannot
/// interfere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    gene_names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(gene_names: Vec<String>) -> Arc<Self> {
        Arc::new(Self { gene_names })
    }

    pub fn len(&self) -> usize {
        self.gene_names.len()
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }
}

/// One measured cell line: identity fields plus RMA expression values in
/// schema order.
///
/// Immutable after construction; measurement values are resolved by feature
/// order against the shared schema, never by per-instance copies of the gene
/// list.
#[derive(Debug, Clone)]
pub struct CellLine {
    name: String,
    cosmic_id: String,
    tcga_label: String,
    expression: Vec<f64>,
    schema: Arc<FeatureSchema>,
}

impl CellLine {
    /// Fails with a shape error if the value count disagrees with the schema
    /// length, so no misaligned entity ever enters a working set.
    pub fn new(
        name: String,
        cosmic_id: String,
        tcga_label: String,
        expression: Vec<f64>,
        schema: Arc<FeatureSchema>,
    ) -> Result<Self, PcaError> {
        if expression.len() != schema.len() {
            return Err(PcaError::ShapeMismatch {
                entity: name,
                got: expression.len(),
                expected: schema.len(),
            });
        }
        Ok(Self {
            name,
            cosmic_id,
            tcga_label,
            expression,
            schema,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cosmic_id(&self) -> &str {
        &self.cosmic_id
    }

    pub fn tcga_label(&self) -> &str {
        &self.tcga_label
    }

    /// Expression values in schema order.
    pub fn expression(&self) -> &[f64] {
        &self.expression
    }

    /// The shared schema handle this cell line was built against.
    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }
}

/// Per-entity category labels, parallel to the cell-line list.
pub fn labels(cell_lines: &[CellLine]) -> Vec<String> {
    cell_lines
        .iter()
        .map(|line| line.tcga_label().to_string())
        .collect()
}

/// The distinct category labels, in first-appearance order.
pub fn targets(cell_lines: &[CellLine]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for line in cell_lines {
        if seen.insert(line.tcga_label()) {
            targets.push(line.tcga_label().to_string());
        }
    }
    targets
}
