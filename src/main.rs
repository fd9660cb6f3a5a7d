fn main() {
    plankton_pipeline::cli::run();
}
