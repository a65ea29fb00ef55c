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
        comment: &'static str,
    }

    const CONFIGS: &[(&str, ConfigValue)] = &[
        ("MIN_CHUNK_BITS", ConfigValue {
            value: 14,
            comment: "The granularity of chunks handed out by the backend, in bits.",
        }),
        ("INTERMEDIATE_BITS", ConfigValue {
            value: 2,
            comment: "The number of mantissa bits of small size classes per octave.",
        }),
        ("MAX_SMALL_SIZECLASS_BITS", ConfigValue {
            value: 16,
            comment: "The largest small size class, in bits.",
        }),
        ("MIN_OBJECT_COUNT", ConfigValue {
            value: 13,
            comment: "The minimal number of objects carved from a small slab.",
        }),
        ("WAKE_THRESHOLD_CAP", ConfigValue {
            value: 32,
            comment: "The upper bound of frees a sleeping slab waits for before waking.",
        }),
        ("REMOTE_SLOT_BITS", ConfigValue {
            value: 8,
            comment: "The number of destination slots of the remote cache, in bits.",
        }),
        ("REMOTE_CACHE", ConfigValue {
            value: 1 << 20,
            comment: "The number of bytes of remote frees buffered before posting.",
        }),
        ("REMOTE_BATCH_LIMIT", ConfigValue {
            value: 1 << 20,
            comment: "The number of bytes of inbound messages processed per drain.",
        }),
        ("REMOTE_RING_BYTES", ConfigValue {
            value: 1 << 12,
            comment: "The number of bytes batched into one ring before it is closed.",
        }),
        ("REMOTE_RING_SLOTS", ConfigValue {
            value: 8,
            comment: "The number of rings kept open at the same time.",
        }),
        ("LOCAL_CACHE_BITS", ConfigValue {
            value: 21,
            comment: "The largest block cached by a thread-local address-space cache, in bits.",
        }),
        ("GLOBAL_REFILL_BITS", ConfigValue {
            value: 24,
            comment: "The size of address-space reservations requested from the OS, in bits.",
        }),
    ];

    let mut configs = CONFIGS.iter().copied().collect::<BTreeMap<_, _>>();

    for (env, value) in std::env::vars() {
        if let Some(name) = env.strip_prefix("PA_")
            && let Some(slot) = configs.get_mut(name)
            && let Ok(value) = value.parse::<usize>()
        {
            slot.value = value;
        }
    }
    for name in configs.keys() {
        println!("cargo:rerun-if-env-changed=PA_{name}");
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
        .write_to_file("postalloc.h");
}
