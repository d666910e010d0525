use super::*;

#[test]
fn defaults_resolve_to_host_values() {
    let config = OrmConfig::default();
    assert!(config.commit.queue_count() >= 1);
    assert_eq!(config.commit.queue_capacity(), 100_000);
    assert!(config.source.is_empty());
}

#[test]
fn toml_sections_deserialize() {
    let config = OrmConfig::from_toml(
        r#"
        [commit]
        queues = 3
        capacity = 64

        [source.memory.main]
        addr = ""

        [source.mysql.game]
        addr = "mysql://localhost/game"
        pool = 4
        conn = 16
        "#,
    )
    .expect("parse");

    assert_eq!(config.commit.queue_count(), 3);
    assert_eq!(config.commit.queue_capacity(), 64);
    assert!(config.source["memory"].contains_key("main"));
    let game = &config.source["mysql"]["game"];
    assert_eq!(game.pool, 4);
    assert_eq!(game.conn, 16);
}

#[test]
fn zero_sizes_fall_back_to_defaults() {
    let config = OrmConfig::from_toml(
        r#"
        [commit]
        queues = 0
        capacity = 0
        "#,
    )
    .expect("parse");

    assert!(config.commit.queue_count() >= 1);
    assert_eq!(config.commit.queue_capacity(), 100_000);
}

#[test]
fn addr_interpolation_reads_the_environment() {
    std::env::set_var("STRATO_TEST_DSN", "mysql://db:3306/app");
    let mut config = OrmConfig::from_toml(
        r#"
        [source.mysql.app]
        addr = "${STRATO_TEST_DSN}?charset=utf8"
        "#,
    )
    .expect("parse");

    config.resolve_addrs().expect("resolve");
    assert_eq!(
        config.source["mysql"]["app"].addr,
        "mysql://db:3306/app?charset=utf8"
    );
}

#[test]
fn missing_variable_is_a_typed_error() {
    let mut config = OrmConfig::from_toml(
        r#"
        [source.mysql.app]
        addr = "${STRATO_TEST_UNSET_VAR}"
        "#,
    )
    .expect("parse");

    let err = config.resolve_addrs().unwrap_err();
    assert!(matches!(err, ConfigError::MissingVar { .. }));
}

#[test]
fn literal_text_without_references_passes_through() {
    let mut config = OrmConfig::from_toml(
        r#"
        [source.memory.main]
        addr = "plain-address"
        "#,
    )
    .expect("parse");

    config.resolve_addrs().expect("resolve");
    assert_eq!(config.source["memory"]["main"].addr, "plain-address");
}
