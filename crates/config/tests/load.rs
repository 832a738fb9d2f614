use app_config::AppConfig;
use std::time::Duration;

#[test]
fn test_load_default_config() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.run_address, "0.0.0.0:8081");
    assert_eq!(cfg.nats_subject, "orders");
    assert_eq!(cfg.nats_subscribers, 5);
    assert_eq!(cfg.workers, 10);
    assert_eq!(cfg.max_inflight, 20);
    assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
}
