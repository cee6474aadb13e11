use chrono::Local;

/// Write a timestamped diagnostic line to stderr.
///
/// `component` is a short subsystem tag (`boot`, `runner`, `control`, ...)
/// and `service` attributes the line to one supervised service when it
/// applies. Service lifecycle output has its own stream (`Service::logs`);
/// this is only for daemon-side diagnostics.
pub fn event(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
    match service {
        Some(name) => eprintln!("{ts} [{component}] service={name} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}
