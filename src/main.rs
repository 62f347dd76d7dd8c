fn main() {
    tabwatch_lib::run()
}
