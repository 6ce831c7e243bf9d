pub mod authproxyworkload_types;
