use std::{
    collections::BTreeMap,
    io::{BufWriter, Write},
};

fn main() {
    generate_configs();
    #[cfg(feature = "c-bindgen")]
    generate_c_bindings();
}

fn generate_configs() {
    #[derive(Debug, Clone, Copy)]
    struct ConfigValue {
        value: usize,
        min: usize,
        max: usize,
        comment: &'static str,
    }

    const CONFIGS: &[(&str, ConfigValue)] = &[
        ("PAGE_SHIFT", ConfigValue {
            value: 13,
            min: 12,
            max: 16,
            comment: "The page granularity of the page heap, in bits.",
        }),
        ("MAX_SIZE_SHIFT", ConfigValue {
            value: 18,
            min: 15,
            max: 18,
            comment: "The largest size served by size classes, in bits.",
        }),
    ];

    let mut configs = CONFIGS.iter().copied().collect::<BTreeMap<_, _>>();

    for (env, value) in std::env::vars() {
        if let Some(name) = env.strip_prefix("SPANALLOC_")
            && let Some(slot) = configs.get_mut(name)
            && let Ok(value) = value.parse::<usize>()
        {
            slot.value = value.clamp(slot.min, slot.max);
        }
    }
    for (name, _) in CONFIGS {
        println!("cargo:rerun-if-env-changed=SPANALLOC_{name}");
    }

    let output_dir = std::env::var("OUT_DIR").unwrap();
    let file = std::fs::File::create(format!("{output_dir}/config.rs")).unwrap();
    let mut file = BufWriter::new(file);

    for (name, config) in configs {
        writeln!(
            &mut file,
            "#[doc = \"{}\"] pub const {name}: usize = {};",
            config.comment, config.value
        )
        .unwrap();
    }
}

#[cfg(feature = "c-bindgen")]
fn generate_c_bindings() {
    let crate_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(cbindgen::Config::from_root_or_default(crate_dir))
        .generate()
        .expect("failed to generate C bindings")
        .write_to_file("spanalloc.h");
}
