/// Route panics through tracing, with a backtrace, before the default
/// hook runs. With a log directory configured stderr may go nowhere.
pub fn register_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let payload = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("!?");
        let bt = backtrace::Backtrace::new();
        if let Some(loc) = info.location() {
            tracing::error!(
                "panic in pid {} at {}:{}:{} - {}\n{:?}",
                std::process::id(),
                loc.file(),
                loc.line(),
                loc.column(),
                payload,
                bt
            );
        } else {
            tracing::error!("panic in pid {} - {}\n{:?}", std::process::id(), payload, bt);
        }

        default_hook(info);
    }));
}
