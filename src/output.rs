// output.rs
//
// TSV exporters for the plotting collaborator: projection coordinates with
// per-entity labels, per-component loadings, the explained/cumulative
// variance table, and the distinct label set.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{anyhow, Result};
use log::info;
use ndarray::{Array1, Array2};

use crate::model::{labels, CellLine, FeatureSchema};
use crate::pca::PcaRun;

fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
    let filename = format!("{}.{}", prefix, suffix);
    File::create(&filename)
        .map(BufWriter::new)
        .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
}

fn write_projection_to<W: Write>(
    writer: &mut W,
    cell_lines: &[CellLine],
    scores: &Array2<f64>,
) -> Result<()> {
    write!(writer, "CellLine\tCosmicId\tLabel")?;
    for i in 1..=scores.ncols() {
        write!(writer, "\tPC{}", i)?;
    }
    writeln!(writer)?;

    let labels = labels(cell_lines);
    for (row, (line, label)) in cell_lines.iter().zip(&labels).enumerate() {
        write!(writer, "{}\t{}\t{}", line.name(), line.cosmic_id(), label)?;
        for col in 0..scores.ncols() {
            write!(writer, "\t{:.6}", scores[[row, col]])?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Writes the M x K subspace coordinates, one row per cell line, parallel to
/// the entity list.
pub fn write_projection(
    prefix: &str,
    cell_lines: &[CellLine],
    scores: &Array2<f64>,
) -> Result<()> {
    if scores.nrows() != cell_lines.len() {
        return Err(anyhow!(
            "Projection has {} rows but {} cell lines were given.",
            scores.nrows(),
            cell_lines.len()
        ));
    }
    let mut writer = create_output_file(prefix, "projection.tsv")?;
    info!("Writing subspace coordinates to {}.projection.tsv", prefix);
    write_projection_to(&mut writer, cell_lines, scores)
}

fn write_loadings_to<W: Write>(
    writer: &mut W,
    schema: &FeatureSchema,
    loadings: &[Array1<f64>],
) -> Result<()> {
    write!(writer, "Gene")?;
    for i in 1..=loadings.len() {
        write!(writer, "\tPC{}_loading", i)?;
    }
    writeln!(writer)?;

    for (gene_idx, gene) in schema.gene_names().iter().enumerate() {
        write!(writer, "{}", gene)?;
        for loading in loadings {
            write!(writer, "\t{:.6}", loading[gene_idx])?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Writes per-gene loadings, one column per selected component in rank order.
pub fn write_loadings(
    prefix: &str,
    schema: &FeatureSchema,
    loadings: &[Array1<f64>],
) -> Result<()> {
    if loadings.iter().any(|l| l.len() != schema.len()) {
        return Err(anyhow!(
            "Loading vector length disagrees with the {}-gene schema.",
            schema.len()
        ));
    }
    let mut writer = create_output_file(prefix, "loadings.tsv")?;
    info!("Writing component loadings to {}.loadings.tsv", prefix);
    write_loadings_to(&mut writer, schema, loadings)
}

fn write_variance_to<W: Write>(writer: &mut W, run: &PcaRun) -> Result<()> {
    writeln!(
        writer,
        "PC\tEigenvalue\tExplainedVariance\tCumulativeVariance"
    )?;
    // leading zero row so the cumulative column has K+1 entries
    writeln!(writer, "0\tNA\tNA\t{:.6}", run.cumulative[0])?;
    for rank in 0..run.selected.len() {
        writeln!(
            writer,
            "{}\t{:.6}\t{:.6}\t{:.6}",
            rank + 1,
            run.eigenvalues[rank],
            run.explained[rank],
            run.cumulative[rank + 1]
        )?;
    }
    Ok(())
}

/// Writes eigenvalues, explained-variance fractions, and the cumulative
/// sequence (leading zero row included) per selected component.
pub fn write_variance(prefix: &str, run: &PcaRun) -> Result<()> {
    let mut writer = create_output_file(prefix, "variance.tsv")?;
    info!("Writing variance metrics to {}.variance.tsv", prefix);
    write_variance_to(&mut writer, run)
}

/// Writes the distinct category labels, one per line, in first-appearance
/// order.
pub fn write_targets(prefix: &str, targets: &[String]) -> Result<()> {
    let mut writer = create_output_file(prefix, "targets.tsv")?;
    info!("Writing {} distinct labels to {}.targets.tsv", targets.len(), prefix);
    for target in targets {
        writeln!(writer, "{}", target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CellLine, FeatureSchema};
    use ndarray::array;

    fn sample_lines() -> Vec<CellLine> {
        let schema = FeatureSchema::new(vec!["g1".to_string(), "g2".to_string()]);
        vec![
            CellLine::new(
                "AU565".to_string(),
                "910704".to_string(),
                "BRCA".to_string(),
                vec![1.0, 2.0],
                schema.clone(),
            )
            .unwrap(),
            CellLine::new(
                "NCI-H1650".to_string(),
                "687800".to_string(),
                "LUAD".to_string(),
                vec![3.0, 4.0],
                schema,
            )
            .unwrap(),
        ]
    }

    #[test]
    fn projection_rows_carry_name_label_and_scores() {
        let lines = sample_lines();
        let scores = array![[0.5, -1.25], [-0.5, 1.25]];
        let mut buffer = Vec::new();
        write_projection_to(&mut buffer, &lines, &scores).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut rows = text.lines();
        assert_eq!(rows.next(), Some("CellLine\tCosmicId\tLabel\tPC1\tPC2"));
        assert_eq!(rows.next(), Some("AU565\t910704\tBRCA\t0.500000\t-1.250000"));
        assert_eq!(
            rows.next(),
            Some("NCI-H1650\t687800\tLUAD\t-0.500000\t1.250000")
        );
        assert_eq!(rows.next(), None);
    }

    #[test]
    fn loadings_are_gene_major_with_component_columns() {
        let schema = FeatureSchema::new(vec!["g1".to_string(), "g2".to_string()]);
        let loadings = vec![array![2.0, 0.0], array![0.0, 1.0]];
        let mut buffer = Vec::new();
        write_loadings_to(&mut buffer, &schema, &loadings).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut rows = text.lines();
        assert_eq!(rows.next(), Some("Gene\tPC1_loading\tPC2_loading"));
        assert_eq!(rows.next(), Some("g1\t2.000000\t0.000000"));
        assert_eq!(rows.next(), Some("g2\t0.000000\t1.000000"));
    }

    #[test]
    fn variance_table_has_leading_zero_row() {
        let run = PcaRun {
            selected: vec![1, 0],
            eigenvalues: vec![3.0, 1.0],
            scores: array![[0.0, 0.0]],
            loadings: vec![],
            explained: vec![0.75, 0.25],
            cumulative: vec![0.0, 0.75, 1.0],
        };
        let mut buffer = Vec::new();
        write_variance_to(&mut buffer, &run).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut rows = text.lines();
        assert_eq!(
            rows.next(),
            Some("PC\tEigenvalue\tExplainedVariance\tCumulativeVariance")
        );
        assert_eq!(rows.next(), Some("0\tNA\tNA\t0.000000"));
        assert_eq!(rows.next(), Some("1\t3.000000\t0.750000\t0.750000"));
        assert_eq!(rows.next(), Some("2\t1.000000\t0.250000\t1.000000"));
    }
}
