pub mod failing;
pub mod limited;
pub mod smoke;

use std::sync::Once;

/// Installs a test-friendly `tracing` subscriber once per process. `RUST_LOG` selects the
/// verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Expands to the conformance suite for one backend. `$register` is a
/// `fn(&mut RegistryBuilder) -> RuntimeResult<()>` that registers the backend together with
/// the reference implementations it falls back to.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $register:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::smoke;

            macro_rules! conformance_test {
                ($name:ident) => {
                    #[test]
                    fn $name() -> ::anyhow::Result<()> {
                        $crate::init_tracing();
                        smoke::$name($register)
                    }
                };
            }

            conformance_test!(static_add_of_ones);
            conformance_test!(matmul_matches_expected);
            conformance_test!(dynamic_add_respecializes_once);
            conformance_test!(out_of_support_shape_reselects);
            conformance_test!(failed_finalize_falls_back);
            conformance_test!(unary_reduce_bit_identical);
            conformance_test!(execution_is_deterministic);
            conformance_test!(finalize_is_idempotent);
            conformance_test!(artifacts_round_trip);
            conformance_test!(foreign_fingerprint_is_rejected);
        }
    };
}
