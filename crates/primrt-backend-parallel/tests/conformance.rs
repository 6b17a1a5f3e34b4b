primrt_backend_tests::define_backend_tests!(parallel_backend, primrt_backend_parallel::register);
