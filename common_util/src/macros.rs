// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Contains all needed macros.

/// Define result for given Error type.
#[macro_export]
macro_rules! define_result {
    ($t:ty) => {
        pub type Result<T, E = $t> = std::result::Result<T, E>;
    };
}

#[cfg(test)]
mod tests {
    define_result!(i32);

    fn return_i32_error() -> Result<()> {
        Err(18)
    }

    #[test]
    fn test_define_result() {
        assert_eq!(return_i32_error(), Err(18));
    }
}
