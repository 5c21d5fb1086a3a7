//! Identifier and document-number helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique record id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// `<prefix>-<year>-<zero padded sequence>`, e.g. `AFE-2025-00042`
pub fn format_document_number(prefix: &str, year: i32, sequence: u64, width: usize) -> String {
    format!("{prefix}-{year}-{sequence:0width$}")
}

/// Float comparison for monetary totals that went through summation
pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}
