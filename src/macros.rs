#[macro_export]
macro_rules! tree {
    ($e:expr) => {{
        use $crate::tree::newick::from_newick;
        from_newick($e, None).unwrap()
    }};
}
