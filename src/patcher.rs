//! Emits the relocated image from the original bytes and a relocation map

use crate::analyzer::ByteRole;
use crate::error::{AnalysisError, RelocationErrorKind};
use crate::image::ProgramImage;
use crate::relocation_map::RelocationMap;
use log::debug;

/// Rewrite every operand and address fragment of `image` according to `map`.
/// Pure: reads nothing but its arguments.
pub fn apply(image: &ProgramImage, map: &RelocationMap) -> Result<Vec<u8>, AnalysisError> {
    let original = image.bytes();
    let mut bytes = original.to_vec();
    let mut patched = 0;

    for (offset, role) in map.roles.iter().enumerate() {
        match *role {
            ByteRole::OperandLow(instr) => {
                if let Some(runtime) = map.runtime_operands.get(&instr) {
                    // Written halves are overwritten before use; keep them
                    let [lo, hi] = map.relocate_address(runtime.primary()).to_le_bytes();
                    if !runtime.written_low {
                        bytes[offset] = lo;
                    }
                    if !runtime.written_high {
                        bytes[offset + 1] = hi;
                    }
                } else if map.indexed_operands.contains(&instr) {
                    let address = u16::from_le_bytes([original[offset], original[offset + 1]]);
                    let relocated = map.shift_by_code_delta(address).ok_or_else(|| {
                        AnalysisError::at(
                            RelocationErrorKind::AddressOutOfRange,
                            offset,
                            format!(
                                "indexed base ${:04X} moved by {:+} leaves memory",
                                address, map.code_delta
                            ),
                        )
                    })?;
                    let [lo, hi] = relocated.to_le_bytes();
                    bytes[offset] = lo;
                    bytes[offset + 1] = hi;
                } else {
                    let address = u16::from_le_bytes([original[offset], original[offset + 1]]);
                    let relocated = map.relocate_address(address);
                    check_absolute(map, offset, address, relocated)?;
                    let [lo, hi] = relocated.to_le_bytes();
                    bytes[offset] = lo;
                    bytes[offset + 1] = hi;
                }
                patched += 1;
            }
            ByteRole::ZeroPageOperand(_) => {
                let zp = original[offset];
                bytes[offset] = map.translate_zero_page(zp).ok_or_else(|| {
                    AnalysisError::at(
                        RelocationErrorKind::AddressOutOfRange,
                        offset,
                        format!("zero-page operand ${:02X} has no mapping", zp),
                    )
                })?;
                if !map.zp_window.contains(bytes[offset]) {
                    return Err(AnalysisError::at(
                        RelocationErrorKind::AddressOutOfRange,
                        offset,
                        format!(
                            "zero-page operand ${:02X} maps to ${:02X}, outside {}",
                            zp, bytes[offset], map.zp_window
                        ),
                    ));
                }
                patched += 1;
            }
            ByteRole::AddressFragmentData { kind, describes } => {
                bytes[offset] = kind.of(map.relocate_address(describes));
                patched += 1;
            }
            ByteRole::Unclassified => {
                return Err(AnalysisError::at(
                    RelocationErrorKind::AmbiguousByteRole,
                    offset,
                    "unclassified byte reached the patcher",
                ));
            }
            // Opcodes, relative and immediate operands, plain data
            _ => {}
        }
    }

    debug!(
        "patched {} operands and fragments of {} bytes",
        patched,
        bytes.len()
    );
    Ok(bytes)
}

fn check_absolute(
    map: &RelocationMap,
    offset: usize,
    address: u16,
    relocated: u16,
) -> Result<(), AnalysisError> {
    if map.contains_original(address) && !map.contains_relocated(relocated) {
        return Err(AnalysisError::at(
            RelocationErrorKind::AddressOutOfRange,
            offset,
            format!(
                "${:04X} relocates to ${:04X}, outside the target code segment",
                address, relocated
            ),
        ));
    }
    Ok(())
}
