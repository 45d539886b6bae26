//! Tests for error handling

use burrow_core::descriptor::{OffsetGroup, VersionTable};
use burrow_core::error::{BurrowError, DefinitionKind, Result};
use burrow_core::types::Address;

#[test]
fn test_definition_errors_name_group_and_key()
{
    let mut root = OffsetGroup::root();
    root.group_mut("string").group_mut("msvc").set_offset("size", 0x10);
    let msvc = root.group_path("string.msvc").unwrap();

    let err = msvc.offset("capacity").unwrap_err();
    assert!(err.is_definition_error());
    assert_eq!(err.to_string(), "Missing offset definition: string.msvc.capacity");

    let err = root.hex_value_path("string.msvc.inline_capacity").unwrap_err();
    assert_eq!(err.to_string(), "Missing hex value definition: string.msvc.inline_capacity");
}

#[test]
fn test_missing_group_reports_deepest_existing_group()
{
    let mut root = OffsetGroup::root();
    root.group_mut("creature");
    match root.offset_path("creature.body.head").unwrap_err() {
        BurrowError::MissingDefinition { kind, group, key } => {
            assert_eq!(kind, DefinitionKind::Group);
            assert_eq!(group, "creature.");
            assert_eq!(key, "body");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_memory_errors_carry_the_range()
{
    let err = BurrowError::MemoryRead {
        address: Address::new(0xdead_0000),
        length: 4,
        details: "range is not mapped".to_string(),
    };
    let message = err.to_string();
    assert!(message.contains("0x00000000dead0000"));
    assert!(message.contains("4 bytes"));
    assert!(!err.is_definition_error());
    assert!(!err.is_process_gone());
}

#[test]
fn test_process_gone_classification()
{
    assert!(BurrowError::ProcessExited(42).is_process_gone());
    assert_eq!(BurrowError::ProcessExited(42).to_string(), "Process 42 has exited");
}

#[test]
fn test_ambiguous_target_lists_pids()
{
    let err = BurrowError::AmbiguousTarget {
        name: "Dwarf_Fortress".to_string(),
        pids: vec![100, 200],
    };
    assert_eq!(err.to_string(), "Ambiguous target 'Dwarf_Fortress': matching PIDs [100, 200]");
}

#[test]
fn test_bad_toml_becomes_config_error()
{
    let err = VersionTable::from_toml_str("[[version]\nname = ").unwrap_err();
    assert!(matches!(err, BurrowError::Config(_)));
}

#[test]
fn test_io_error_conversion()
{
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
    let err: BurrowError = io.into();
    assert!(matches!(err, BurrowError::Io(_)));
}

#[test]
fn test_result_alias()
{
    fn lookup(ok: bool) -> Result<u32>
    {
        if ok {
            Ok(1)
        } else {
            Err(BurrowError::NotSuspended)
        }
    }

    assert_eq!(lookup(true).unwrap(), 1);
    assert!(matches!(lookup(false), Err(BurrowError::NotSuspended)));
}
