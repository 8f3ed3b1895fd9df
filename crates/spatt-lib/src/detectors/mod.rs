pub mod eog;
