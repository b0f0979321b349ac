pub fn info(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix("INFO", tag), message.as_ref());
}

pub fn success(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix(" OK ", tag), message.as_ref());
}

pub fn warn(tag: &str, message: impl AsRef<str>) {
    eprintln!("{} {}", prefix("WARN", tag), message.as_ref());
}

fn prefix(level: &str, tag: &str) -> String {
    format!("[{level}][{tag:<5}]")
}

pub fn startup_summary(title: &str, lines: &[(&str, String)]) {
    println!("{title}");
    for (key, value) in lines {
        println!("  {key:<14} {value}");
    }
}

pub fn format_hashrate(hps: f64) -> String {
    const UNITS: [(f64, &str); 3] = [
        (1_000_000_000.0, "GH/s"),
        (1_000_000.0, "MH/s"),
        (1_000.0, "KH/s"),
    ];

    for (scale, unit) in UNITS {
        if hps >= scale {
            return format!("{:.2} {unit}", hps / scale);
        }
    }
    format!("{hps:.2} H/s")
}
