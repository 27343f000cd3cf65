use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use enpu::arch::{Accelerator, ArchitectureFeatures};
use enpu::check::is_supported_operator;
use enpu::{NpuBlockType, OpKind, SupportedOperators};
use listing::Listing;
use num_traits::FromPrimitive;

mod listing;

fn main() {
    let accelerator = match std::env::args().nth(1) {
        Some(name) => match parse_accelerator(&name) {
            Some(accelerator) => accelerator,
            None => {
                eprintln!("unknown accelerator '{name}'");
                eprintln!("expected one of: u55-32, u55-64, u55-128, u55-256, u65-256, u65-512");
                std::process::exit(1);
            }
        },
        None => Accelerator::U55_256,
    };

    let version = enpu::api::npu_get_api_version();
    println!("enpu API version {}.{}", version >> 16, version & 0xFFFF);
    println!();

    print_accelerator(accelerator);
    println!();
    print_operator_table();
    println!();
    print_constraint_report();
}

fn parse_accelerator(name: &str) -> Option<Accelerator> {
    match name.to_ascii_lowercase().as_str() {
        "u55-32" => Some(Accelerator::U55_32),
        "u55-64" => Some(Accelerator::U55_64),
        "u55-128" => Some(Accelerator::U55_128),
        "u55-256" => Some(Accelerator::U55_256),
        "u65-256" => Some(Accelerator::U65_256),
        "u65-512" => Some(Accelerator::U65_512),
        _ => None,
    }
}

fn print_accelerator(accelerator: Accelerator) {
    let arch = ArchitectureFeatures::new(accelerator);

    let mut info = Listing::new("Accelerator");
    info.row("Configuration", format!("{accelerator:?}"));
    info.row("Cores", arch.cores);
    info.row("MACs/cycle", arch.macs_per_cycle);
    info.row("SHRAM", format!("{} KiB", arch.shram_size / 1024));
    info.row(
        "LUT region",
        format!(
            "0x{:04x}..0x{:04x} ({} slots)",
            arch.shram_lut_address,
            arch.shram_lut_address + arch.shram_lut_size,
            enpu::LUT_SLOT_COUNT
        ),
    );
    info.row("Reserved banks", arch.shram_reserved_unused_banks);
    print!("{info}");
}

fn supported_kinds() -> Vec<OpKind> {
    (0..=255u16)
        .filter_map(OpKind::from_u16)
        .filter(|kind| is_supported_operator(*kind))
        .collect()
}

fn print_operator_table() {
    let support = SupportedOperators::new();

    println!("Operators the NPU can run:");
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Operator", "External name", "Block type", "Checks"]);

    for kind in supported_kinds() {
        let block_type = match kind.default_block_type() {
            NpuBlockType::Default => "-".to_string(),
            block_type => format!("{block_type:?}"),
        };
        let checks =
            support.generic_constraints().len() + support.specific_constraints(kind).len();
        table.add_row([
            format!("{kind:?}"),
            kind.external_name().to_string(),
            block_type,
            checks.to_string(),
        ]);
    }

    println!("{table}");
}

fn print_constraint_report() {
    let support = SupportedOperators::new();

    println!("Generic constraints, applied to every operator:");
    for constraint in support.generic_constraints() {
        println!("  - {}", constraint.doc);
    }

    for kind in supported_kinds() {
        let constraints = support.specific_constraints(kind);
        if constraints.is_empty() {
            continue;
        }
        println!();
        println!("{:?} ({}):", kind, kind.external_name());
        for constraint in constraints {
            println!("  - {}", constraint.doc);
        }
    }
}
