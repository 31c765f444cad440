//! PCR selection parsing.
//!
//! A selection is a comma-separated list of PCR indices with an optional
//! `bank:` prefix, e.g. `0,1,2,7` or `sha256:0,4,7`.  The bank defaults to
//! SHA-256, duplicate indices collapse, and anything outside 0..=23 is
//! rejected.

use tss_esapi::{
    interface_types::algorithm::HashingAlgorithm,
    structures::{PcrSelectionList, PcrSlot},
};

use super::TpmError;

fn parse_bank(bank: &str) -> Result<HashingAlgorithm, TpmError> {
    match bank {
        "sha1" => Ok(HashingAlgorithm::Sha1),
        "sha256" => Ok(HashingAlgorithm::Sha256),
        other => Err(TpmError::BadPcr(format!("unknown PCR bank '{other}'"))),
    }
}

fn slot_for(index: u8) -> Result<PcrSlot, TpmError> {
    match index {
        0 => Ok(PcrSlot::Slot0),
        1 => Ok(PcrSlot::Slot1),
        2 => Ok(PcrSlot::Slot2),
        3 => Ok(PcrSlot::Slot3),
        4 => Ok(PcrSlot::Slot4),
        5 => Ok(PcrSlot::Slot5),
        6 => Ok(PcrSlot::Slot6),
        7 => Ok(PcrSlot::Slot7),
        8 => Ok(PcrSlot::Slot8),
        9 => Ok(PcrSlot::Slot9),
        10 => Ok(PcrSlot::Slot10),
        11 => Ok(PcrSlot::Slot11),
        12 => Ok(PcrSlot::Slot12),
        13 => Ok(PcrSlot::Slot13),
        14 => Ok(PcrSlot::Slot14),
        15 => Ok(PcrSlot::Slot15),
        16 => Ok(PcrSlot::Slot16),
        17 => Ok(PcrSlot::Slot17),
        18 => Ok(PcrSlot::Slot18),
        19 => Ok(PcrSlot::Slot19),
        20 => Ok(PcrSlot::Slot20),
        21 => Ok(PcrSlot::Slot21),
        22 => Ok(PcrSlot::Slot22),
        23 => Ok(PcrSlot::Slot23),
        _ => Err(TpmError::BadPcr(format!("PCR index {index} out of range"))),
    }
}

/// Parse a PCR selection expression into a [`PcrSelectionList`].
pub fn parse_pcr_selection(expression: &str) -> Result<PcrSelectionList, TpmError> {
    let (bank, indices) = match expression.split_once(':') {
        Some((bank, rest)) => (parse_bank(bank)?, rest),
        None => (HashingAlgorithm::Sha256, expression),
    };

    let mut parsed: Vec<u8> = indices
        .split(',')
        .map(|token| {
            token
                .trim()
                .parse()
                .map_err(|_| TpmError::BadPcr(format!("invalid PCR index '{token}'")))
        })
        .collect::<Result<_, _>>()?;
    parsed.sort_unstable();
    parsed.dedup();

    let slots: Vec<PcrSlot> = parsed
        .into_iter()
        .map(slot_for)
        .collect::<Result<_, _>>()?;
    PcrSelectionList::builder()
        .with_selection(bank, &slots)
        .build()
        .map_err(TpmError::from)
}
