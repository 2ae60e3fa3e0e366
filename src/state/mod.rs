pub mod access_tree;
