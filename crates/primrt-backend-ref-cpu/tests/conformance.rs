primrt_backend_tests::define_backend_tests!(reference_backend, primrt_backend_ref_cpu::register);
