#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::env;
    use std::sync::Mutex;
    use tokio::test;

    /// Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn clear_all() {
        for key in [
            "SMTP_CORE_HOSTNAME",
            "SMTP_CORE_BIND_ADDRESS",
            "SMTP_CORE_PORT",
            "SMTP_CORE_UNIX_SOCKET",
            "SMTP_CORE_LMTP",
            "SMTP_CORE_LINE_LENGTH_LIMIT",
            "SMTP_CORE_DATA_SIZE_LIMIT",
            "SMTP_CORE_COMMAND_TIMEOUT",
            "SMTP_CORE_PROXY_TIMEOUT",
            "SMTP_CORE_REQUIRE_STARTTLS",
            "SMTP_CORE_TLS_CERT",
            "SMTP_CORE_TLS_KEY",
            "SMTP_CORE_IMPLICIT_TLS",
            "SMTP_CORE_AUTH_REQUIRED",
            "SMTP_CORE_AUTH_REQUIRE_TLS",
            "SMTP_CORE_AUTH_MAX_ATTEMPTS",
            "SMTP_CORE_AUTH_EXCLUDE",
            "SMTP_CORE_ENABLE_SMTPUTF8",
            "SMTP_CORE_ENABLE_8BITMIME",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    async fn test_config_default_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();

        let config = Config::from_env().expect("defaults alone must be loadable");

        assert_eq!(config.server_hostname, "localhost");
        assert_eq!(config.smtp_bind_address, "::1");
        assert_eq!(config.smtp_port, 8025);
        assert!(!config.lmtp_mode);
        assert_eq!(config.line_length_limit, DEFAULT_LINE_LENGTH_LIMIT);
        assert_eq!(config.data_size_limit, DEFAULT_DATA_SIZE_LIMIT);
        assert_eq!(config.proxy_protocol_timeout_secs, 0);
        assert!(config.auth_require_tls);
        assert!(config.auth_exclude_mechanism.is_empty());

        clear_all();
    }

    #[test]
    async fn test_config_from_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();

        env::set_var("SMTP_CORE_HOSTNAME", "mail.example.org");
        env::set_var("SMTP_CORE_BIND_ADDRESS", "127.0.0.1");
        env::set_var("SMTP_CORE_PORT", "2525");
        env::set_var("SMTP_CORE_LMTP", "true");
        env::set_var("SMTP_CORE_DATA_SIZE_LIMIT", "1048576");
        env::set_var("SMTP_CORE_AUTH_EXCLUDE", "LOGIN, plain ,");

        let config = Config::from_env().expect("overrides must be loadable");

        assert_eq!(config.server_hostname, "mail.example.org");
        assert_eq!(config.smtp_bind_address, "127.0.0.1");
        assert_eq!(config.smtp_port, 2525);
        assert!(config.lmtp_mode);
        assert_eq!(config.data_size_limit, 1_048_576);
        assert_eq!(config.auth_exclude_mechanism, vec!["LOGIN", "PLAIN"]);

        clear_all();
    }

    #[test]
    async fn test_config_rejects_bad_port() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("SMTP_CORE_PORT", "not-a-port");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_all();
    }

    #[test]
    async fn test_config_rejects_conflicting_tls_modes() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("SMTP_CORE_IMPLICIT_TLS", "true");
        env::set_var("SMTP_CORE_REQUIRE_STARTTLS", "true");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_all();
    }
}
