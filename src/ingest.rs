// ingest.rs
//
// Loads the two tab-separated inputs -- the cell-line metadata table and the
// gene-major RMA expression table -- filters them, joins them on a selectable
// identifier, and produces the clean cell-line list plus the frozen feature
// schema the PCA engine runs on.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use log::{debug, info, warn};

use crate::model::{CellLine, FeatureSchema};

/// Metadata rows with this tissue label carry no usable classification and
/// are dropped.
const UNCLASSIFIED_LABEL: &str = "UNCLASSIFIED";

/// Which identifier joins a metadata row to its expression column.
///
/// A fixed, statically enumerable selector: the set of valid choices is the
/// set of variants, and each maps to one accessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LookupKey {
    /// Join on the cell-line name.
    Name,
    /// Join on the COSMIC ID.
    CosmicId,
}

impl LookupKey {
    fn field<'a>(&self, row: &'a MetadataRow) -> &'a str {
        match self {
            LookupKey::Name => &row.name,
            LookupKey::CosmicId => &row.cosmic_id,
        }
    }
}

/// Column names to pull from the metadata header. Defaults match the GDSC
/// cell-line annotation file.
#[derive(Clone, Debug)]
pub struct MetadataColumns {
    pub name: String,
    pub cosmic_id: String,
    pub tcga_label: String,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        Self {
            name: "Name".to_string(),
            cosmic_id: "COSMIC_ID".to_string(),
            tcga_label: "Tissue sub-type".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetadataRow {
    pub name: String,
    pub cosmic_id: String,
    pub tcga_label: String,
}

/// The parsed expression table: the frozen gene schema plus one value vector
/// per cell-line column, each in schema order.
#[derive(Debug)]
pub struct ExpressionTable {
    schema: Arc<FeatureSchema>,
    columns: HashMap<String, Vec<f64>>,
}

impl ExpressionTable {
    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    /// Expression values for one cell-line identifier, in schema order.
    pub fn values_for(&self, identifier: &str) -> Option<&[f64]> {
        self.columns.get(identifier).map(Vec::as_slice)
    }
}

fn is_missing(field: &str) -> bool {
    field.is_empty() || field.eq_ignore_ascii_case("nan") || field == "NA"
}

/// Reads the metadata table: a header line naming the columns, then one row
/// per cell line. Duplicated COSMIC IDs keep the first occurrence; rows with
/// missing fields or an `UNCLASSIFIED` tissue label are dropped.
pub fn read_metadata(reader: impl BufRead, columns: &MetadataColumns) -> Result<Vec<MetadataRow>> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("Metadata file is empty."))?
        .context("Failed to read metadata header")?;
    let header_fields: Vec<&str> = header.trim_end_matches('\r').split('\t').collect();

    let column_index = |wanted: &str| -> Result<usize> {
        header_fields
            .iter()
            .position(|field| *field == wanted)
            .ok_or_else(|| {
                anyhow!(
                    "Metadata header has no '{}' column (found: {:?}).",
                    wanted,
                    header_fields
                )
            })
    };
    let name_idx = column_index(&columns.name)?;
    let cosmic_idx = column_index(&columns.cosmic_id)?;
    let label_idx = column_index(&columns.tcga_label)?;

    let mut rows = Vec::new();
    let mut seen_cosmic_ids = HashSet::new();
    let mut dropped = 0usize;

    for (line_num, line_result) in lines.enumerate() {
        let line = line_result
            .with_context(|| format!("Error reading metadata line {}", line_num + 2))?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let field_at = |idx: usize| fields.get(idx).map(|f| f.trim()).unwrap_or("");

        let name = field_at(name_idx);
        let cosmic_id = field_at(cosmic_idx);
        let tcga_label = field_at(label_idx);

        if is_missing(name) || is_missing(cosmic_id) || is_missing(tcga_label) {
            debug!("Metadata line {}: missing field, dropped.", line_num + 2);
            dropped += 1;
            continue;
        }
        if tcga_label == UNCLASSIFIED_LABEL {
            debug!("Metadata line {}: unclassified cell line '{}', dropped.", line_num + 2, name);
            dropped += 1;
            continue;
        }
        if !seen_cosmic_ids.insert(cosmic_id.to_string()) {
            debug!(
                "Metadata line {}: duplicate COSMIC ID '{}', keeping first occurrence.",
                line_num + 2,
                cosmic_id
            );
            dropped += 1;
            continue;
        }

        rows.push(MetadataRow {
            name: name.to_string(),
            cosmic_id: cosmic_id.to_string(),
            tcga_label: tcga_label.to_string(),
        });
    }

    if rows.is_empty() {
        bail!("No usable cell-line rows found in the metadata file.");
    }
    info!(
        "Metadata: {} cell lines kept, {} rows dropped (missing/unclassified/duplicate).",
        rows.len(),
        dropped
    );
    Ok(rows)
}

/// Reads the gene-major expression table: the header names the cell-line
/// columns (its first field labels the gene-symbol column and is ignored),
/// and each following row is one gene with a value per cell line.
///
/// Genes with any missing or unparsable value are dropped here, before the
/// core; the surviving genes, in file order, become the frozen schema.
pub fn read_expression(reader: impl BufRead) -> Result<ExpressionTable> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("Expression file is empty."))?
        .context("Failed to read expression header")?;
    let mut header_fields = header.trim_end_matches('\r').split('\t');
    header_fields.next(); // gene-symbol column label
    let sample_ids: Vec<String> = header_fields.map(str::to_string).collect();
    if sample_ids.is_empty() {
        bail!("Expression header names no cell-line columns.");
    }

    let mut gene_names: Vec<String> = Vec::new();
    let mut gene_rows: Vec<Vec<f64>> = Vec::new();
    let mut dropped_genes = 0usize;

    'rows: for (line_num, line_result) in lines.enumerate() {
        let line = line_result
            .with_context(|| format!("Error reading expression line {}", line_num + 2))?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let gene = fields.next().unwrap_or("").trim();
        if is_missing(gene) {
            debug!("Expression line {}: blank gene symbol, dropped.", line_num + 2);
            dropped_genes += 1;
            continue;
        }

        let mut values = Vec::with_capacity(sample_ids.len());
        for field in fields {
            let field = field.trim();
            if is_missing(field) {
                debug!(
                    "Expression line {}: gene '{}' has a missing value, dropped.",
                    line_num + 2,
                    gene
                );
                dropped_genes += 1;
                continue 'rows;
            }
            match field.parse::<f64>() {
                Ok(value) if value.is_finite() => values.push(value),
                _ => {
                    debug!(
                        "Expression line {}: gene '{}' has unparsable value '{}', dropped.",
                        line_num + 2,
                        gene,
                        field
                    );
                    dropped_genes += 1;
                    continue 'rows;
                }
            }
        }
        if values.len() != sample_ids.len() {
            debug!(
                "Expression line {}: gene '{}' has {} values, expected {}, dropped.",
                line_num + 2,
                gene,
                values.len(),
                sample_ids.len()
            );
            dropped_genes += 1;
            continue;
        }

        gene_names.push(gene.to_string());
        gene_rows.push(values);
    }

    if gene_names.is_empty() {
        bail!("No fully numeric gene rows survived in the expression file.");
    }
    info!(
        "Expression: {} genes kept across {} cell-line columns, {} genes dropped.",
        gene_names.len(),
        sample_ids.len(),
        dropped_genes
    );

    // Transpose from gene-major rows into one schema-ordered vector per
    // cell-line column.
    let mut columns: HashMap<String, Vec<f64>> = HashMap::with_capacity(sample_ids.len());
    for (sample_idx, sample_id) in sample_ids.iter().enumerate() {
        let column: Vec<f64> = gene_rows.iter().map(|row| row[sample_idx]).collect();
        if columns.insert(sample_id.clone(), column).is_some() {
            warn!(
                "Expression header repeats cell-line column '{}'; keeping the last occurrence.",
                sample_id
            );
        }
    }

    Ok(ExpressionTable {
        schema: FeatureSchema::new(gene_names),
        columns,
    })
}

/// Joins metadata rows to expression columns on the chosen identifier and
/// builds the cell-line list. Rows without a matching expression column are
/// skipped; an empty result is an error.
pub fn build_cell_lines(
    metadata: &[MetadataRow],
    expression: &ExpressionTable,
    lookup: LookupKey,
) -> Result<Vec<CellLine>> {
    let schema = expression.schema();
    let mut cell_lines = Vec::with_capacity(metadata.len());
    let mut unmatched = 0usize;

    for row in metadata {
        let key = lookup.field(row);
        let Some(values) = expression.values_for(key) else {
            debug!(
                "Cell line '{}' ({:?}='{}') has no expression column, skipped.",
                row.name, lookup, key
            );
            unmatched += 1;
            continue;
        };
        let line = CellLine::new(
            row.name.clone(),
            row.cosmic_id.clone(),
            row.tcga_label.clone(),
            values.to_vec(),
            schema.clone(),
        )?;
        cell_lines.push(line);
    }

    if cell_lines.is_empty() {
        bail!(
            "No metadata row matched an expression column (lookup key {:?}, {} rows tried).",
            lookup,
            metadata.len()
        );
    }
    info!(
        "Joined {} cell lines to expression data ({} metadata rows unmatched).",
        cell_lines.len(),
        unmatched
    );
    Ok(cell_lines)
}

/// File-level entry point: reads both inputs and returns the frozen schema
/// plus the clean, joined cell-line list.
pub fn load(
    metadata_path: &Path,
    expression_path: &Path,
    columns: &MetadataColumns,
    lookup: LookupKey,
) -> Result<(Arc<FeatureSchema>, Vec<CellLine>)> {
    info!("Reading metadata from {}...", metadata_path.display());
    let metadata_file = File::open(metadata_path)
        .with_context(|| format!("Failed to open metadata file {}", metadata_path.display()))?;
    let metadata = read_metadata(BufReader::new(metadata_file), columns)?;

    info!("Reading expression table from {}...", expression_path.display());
    let expression_file = File::open(expression_path).with_context(|| {
        format!("Failed to open expression file {}", expression_path.display())
    })?;
    let expression = read_expression(BufReader::new(expression_file))?;

    let cell_lines = build_cell_lines(&metadata, &expression, lookup)?;
    Ok((expression.schema().clone(), cell_lines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const METADATA: &str = "\
Name\tCOSMIC_ID\tTissue sub-type
AU565\t910704\tBRCA
CAL-120\t910927\tBRCA
CAL-120\t910927\tBRCA
SW48\t909751\tUNCLASSIFIED
MISSING\t\tLUAD
NCI-H1650\t687800\tLUAD
";

    const EXPRESSION: &str = "\
GENE_SYMBOLS\t910704\t910927\t687800
TSPAN6\t7.2\t6.8\t5.5
BAD_GENE\t1.0\tNaN\t2.0
DPM1\t10.1\t9.9\t11.3
SHORT_GENE\t1.0\t2.0
SCYL3\t3.1\t3.4\t2.9
";

    #[test]
    fn metadata_parsing_filters_duplicates_unclassified_and_missing() {
        let rows = read_metadata(Cursor::new(METADATA), &MetadataColumns::default()).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["AU565", "CAL-120", "NCI-H1650"]);
        assert_eq!(rows[0].cosmic_id, "910704");
        assert_eq!(rows[2].tcga_label, "LUAD");
    }

    #[test]
    fn metadata_parsing_reports_missing_columns() {
        let columns = MetadataColumns {
            name: "CellLineName".to_string(),
            ..MetadataColumns::default()
        };
        let err = read_metadata(Cursor::new(METADATA), &columns).unwrap_err();
        assert!(err.to_string().contains("CellLineName"));
    }

    #[test]
    fn expression_parsing_drops_incomplete_genes_and_keeps_file_order() {
        let table = read_expression(Cursor::new(EXPRESSION)).unwrap();
        assert_eq!(
            table.schema().gene_names(),
            &["TSPAN6".to_string(), "DPM1".to_string(), "SCYL3".to_string()]
        );
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.values_for("910704"), Some(&[7.2, 10.1, 3.1][..]));
        assert_eq!(table.values_for("910927"), Some(&[6.8, 9.9, 3.4][..]));
        assert_eq!(table.values_for("999999"), None);
    }

    #[test]
    fn join_on_cosmic_id_builds_aligned_cell_lines() {
        let metadata = read_metadata(Cursor::new(METADATA), &MetadataColumns::default()).unwrap();
        let expression = read_expression(Cursor::new(EXPRESSION)).unwrap();
        let cell_lines = build_cell_lines(&metadata, &expression, LookupKey::CosmicId).unwrap();

        assert_eq!(cell_lines.len(), 3);
        assert_eq!(cell_lines[0].name(), "AU565");
        assert_eq!(cell_lines[0].expression(), &[7.2, 10.1, 3.1]);
        assert_eq!(cell_lines[2].name(), "NCI-H1650");
        assert_eq!(cell_lines[2].expression(), &[5.5, 11.3, 2.9]);
        assert!(std::sync::Arc::ptr_eq(
            cell_lines[0].schema(),
            cell_lines[2].schema()
        ));
    }

    #[test]
    fn join_on_name_uses_the_name_accessor() {
        let metadata = read_metadata(Cursor::new(METADATA), &MetadataColumns::default()).unwrap();
        // Expression columns keyed by cell-line name instead of COSMIC ID.
        let expression = read_expression(Cursor::new(
            "GENE_SYMBOLS\tAU565\tCAL-120\nTSPAN6\t7.2\t6.8\nDPM1\t10.1\t9.9\n",
        ))
        .unwrap();
        let cell_lines = build_cell_lines(&metadata, &expression, LookupKey::Name).unwrap();
        assert_eq!(cell_lines.len(), 2);
        assert_eq!(cell_lines[1].name(), "CAL-120");
        assert_eq!(cell_lines[1].expression(), &[6.8, 9.9]);
    }

    #[test]
    fn join_with_no_matches_is_an_error() {
        let metadata = read_metadata(Cursor::new(METADATA), &MetadataColumns::default()).unwrap();
        let expression =
            read_expression(Cursor::new("GENE_SYMBOLS\tunrelated\nTSPAN6\t1.0\n")).unwrap();
        assert!(build_cell_lines(&metadata, &expression, LookupKey::CosmicId).is_err());
    }
}
